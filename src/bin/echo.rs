//! Echo server demo.

use clap::Parser;
use loomio::{Config, EventLoop, Server};
use std::net::SocketAddrV4;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "loomio-echo")]
#[command(about = "Multi-reactor echo server")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(long)]
    addr: Option<SocketAddrV4>,

    /// Subordinate I/O loops, overriding the configuration
    #[arg(long)]
    threads: Option<usize>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(addr) = args.addr {
        config.address = addr;
    }
    if let Some(threads) = args.threads {
        config.io_threads = threads;
    }

    loomio::logging::init(&config.log_level);

    let main_loop = match EventLoop::new() {
        Ok(main_loop) => main_loop,
        Err(e) => {
            eprintln!("Failed to create event loop: {}", e);
            std::process::exit(1);
        }
    };
    let server = match Server::new(&main_loop, config.address, config.name, config.reuse_port) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Failed to bind {}: {}", config.address, e);
            std::process::exit(1);
        }
    };
    server.set_io_threads(config.io_threads);

    let high_water_mark = config.high_water_mark;
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            tracing::info!("client {} connected", conn.peer_addr());
            conn.set_high_water_mark_callback(
                |conn, buffered| {
                    tracing::warn!(
                        "client {} is reading slowly, {} bytes buffered",
                        conn.peer_addr(),
                        buffered
                    );
                },
                high_water_mark,
            );
        } else {
            tracing::info!("client {} disconnected", conn.peer_addr());
        }
    });
    server.set_message_callback(|conn, buffer, _receive_time| {
        let data = buffer.retrieve_all_as_bytes();
        conn.send_owned(data);
    });

    tracing::info!("echo server listening on {}", server.listen_addr());
    server.start();
    main_loop.run();
}

fn print_default_config() {
    let config = Config::default();
    println!("name = \"{}\"", config.name);
    println!("address = \"{}\"", config.address);
    println!("io_threads = {}", config.io_threads);
    println!("reuse_port = {}", config.reuse_port);
    println!("high_water_mark = {}", config.high_water_mark);
    println!("log_level = \"{}\"", config.log_level);
}
