//! High-water-mark back-pressure and write-completion.

use loomio::{EventLoop, Server};
use std::io::Read;
use std::net::{SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

/// Large enough that a single non-blocking write cannot be absorbed by the
/// kernel's socket buffers on loopback.
const PAYLOAD_LEN: usize = 32 * 1024 * 1024;
const HIGH_WATER_MARK: usize = 1024;

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_high_water_mark_fires_once_then_write_complete() {
    let high_water_hits = Arc::new(AtomicUsize::new(0));
    let high_water_total = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));

    let (tx, rx) = mpsc::channel::<(Arc<EventLoop>, SocketAddrV4)>();
    let server_thread = {
        let hits = high_water_hits.clone();
        let total = high_water_total.clone();
        let completes = write_completes.clone();
        thread::spawn(move || {
            let main_loop = EventLoop::new().unwrap();
            let server = Server::new(
                &main_loop,
                "127.0.0.1:0".parse().unwrap(),
                "flood",
                false,
            )
            .unwrap();
            server.set_io_threads(1);
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    let hits = hits.clone();
                    let total = total.clone();
                    conn.set_high_water_mark_callback(
                        move |_conn, buffered| {
                            hits.fetch_add(1, Ordering::SeqCst);
                            total.store(buffered, Ordering::SeqCst);
                        },
                        HIGH_WATER_MARK,
                    );
                    conn.send_owned(vec![b'A'; PAYLOAD_LEN]);
                }
            });
            server.set_write_complete_callback(move |_conn| {
                completes.fetch_add(1, Ordering::SeqCst);
            });
            server.start();
            tx.send((main_loop.clone(), server.listen_addr())).unwrap();
            main_loop.run();
        })
    };
    let (main_loop, addr) = rx.recv().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();

    // The client is not reading yet: the send must spill into the output
    // buffer and cross the threshold exactly once.
    wait_for("high-water callback", || {
        high_water_hits.load(Ordering::SeqCst) == 1
    });
    assert!(high_water_total.load(Ordering::SeqCst) >= HIGH_WATER_MARK);
    assert_eq!(write_completes.load(Ordering::SeqCst), 0);

    // Drain everything; the buffered remainder flows as the kernel makes
    // room, and write-complete fires exactly once at the end.
    let mut received = 0usize;
    let mut chunk = vec![0u8; 1024 * 1024];
    while received < PAYLOAD_LEN {
        let n = client.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed early after {received} bytes");
        assert!(chunk[..n].iter().all(|&b| b == b'A'));
        received += n;
    }
    assert_eq!(received, PAYLOAD_LEN);

    wait_for("write-complete callback", || {
        write_completes.load(Ordering::SeqCst) == 1
    });
    assert_eq!(high_water_hits.load(Ordering::SeqCst), 1);

    drop(client);
    main_loop.quit();
    server_thread.join().unwrap();
}
