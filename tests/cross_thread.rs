//! Sends issued from a foreign thread are marshalled onto the owning loop.

use loomio::{Connection, EventLoop, Server};
use parking_lot::Mutex;
use std::io::Read;
use std::net::{SocketAddrV4, TcpStream};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_send_from_foreign_thread_wakes_owning_loop() {
    let captured: Arc<Mutex<Option<Arc<Connection>>>> = Arc::new(Mutex::new(None));

    let (tx, rx) = mpsc::channel::<(Arc<EventLoop>, SocketAddrV4)>();
    let server_thread = {
        let captured = captured.clone();
        thread::spawn(move || {
            let main_loop = EventLoop::new().unwrap();
            let server = Server::new(
                &main_loop,
                "127.0.0.1:0".parse().unwrap(),
                "ping",
                false,
            )
            .unwrap();
            server.set_io_threads(1);
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    *captured.lock() = Some(conn.clone());
                }
            });
            server.start();
            tx.send((main_loop.clone(), server.listen_addr())).unwrap();
            main_loop.run();
        })
    };
    let (main_loop, addr) = rx.recv().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    wait_for("connection capture", || captured.lock().is_some());

    let conn = captured.lock().clone().unwrap();
    assert!(!conn.owner_loop().is_in_loop_thread());

    // Queued as a task and delivered via the eventfd wakeup, far inside
    // the 10-second poll timeout.
    let start = Instant::now();
    conn.send(b"ping");

    let mut received = [0u8; 4];
    client.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"ping");
    assert!(start.elapsed() < Duration::from_secs(2));

    drop(client);
    main_loop.quit();
    server_thread.join().unwrap();
}
