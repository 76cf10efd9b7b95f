//! Round-robin distribution of connections across the loop-thread pool.

use loomio::{EventLoop, Server};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Write};
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
fn test_five_clients_land_on_three_loops_in_order() {
    // Loop threads are named by the pool: rr0, rr1, rr2.
    let assignment: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let message_threads: Arc<Mutex<HashMap<String, String>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let (tx, rx) = mpsc::channel::<(Arc<EventLoop>, SocketAddrV4)>();
    let server_thread = {
        let assignment = assignment.clone();
        let message_threads = message_threads.clone();
        thread::spawn(move || {
            let main_loop = EventLoop::new().unwrap();
            let server =
                Server::new(&main_loop, "127.0.0.1:0".parse().unwrap(), "rr", false).unwrap();
            server.set_io_threads(3);
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    let name = thread::current().name().unwrap_or("").to_string();
                    assignment.lock().push(name);
                }
            });
            server.set_message_callback(move |conn, buffer, _receive_time| {
                let name = thread::current().name().unwrap_or("").to_string();
                message_threads
                    .lock()
                    .insert(conn.name().to_string(), name);
                let data = buffer.retrieve_all_as_bytes();
                conn.send(&data);
            });
            server.start();
            tx.send((main_loop.clone(), server.listen_addr())).unwrap();
            main_loop.run();
        })
    };
    let (main_loop, addr) = rx.recv().unwrap();

    let mut clients = Vec::new();
    for i in 0..5u8 {
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        // Serialize arrivals so assignment order is observable.
        let expected = i as usize + 1;
        wait_for("connection establishment", || {
            assignment.lock().len() == expected
        });

        client.write_all(&[b'0' + i]).unwrap();
        let mut echo = [0u8; 1];
        client.read_exact(&mut echo).unwrap();
        assert_eq!(echo[0], b'0' + i);

        clients.push(client);
    }

    let assigned = assignment.lock().clone();
    assert_eq!(assigned, vec!["rr0", "rr1", "rr2", "rr0", "rr1"]);

    // Every message was handled on the loop its connection is pinned to.
    let by_message = message_threads.lock().clone();
    assert_eq!(by_message.len(), 5);
    for (conn_name, thread_name) in &by_message {
        let conn_id: usize = conn_name
            .rsplit('#')
            .next()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(
            *thread_name,
            format!("rr{}", (conn_id - 1) % 3),
            "connection {conn_name} handled on the wrong loop"
        );
    }

    drop(clients);
    main_loop.quit();
    server_thread.join().unwrap();
}
