//! End-to-end scenarios: hooked sleep, hooked socket I/O with timeouts, and
//! an echo server multiplexing many connections on one worker thread.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use weft_runtime::{fd_registry, hook, net, IoManager};

#[test]
fn test_hooked_sleep_does_not_block_the_worker() {
    let iom = IoManager::new(1, false, "sleep-test");
    let short_done = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();

    // Long sleeper on the only worker
    let observed = short_done.clone();
    iom.schedule(move || {
        hook::sleep_ms(800);
        // the short sleeper must have finished while we were parked
        tx.send(observed.load(Ordering::Acquire)).unwrap();
    });

    // Short sleeper, scheduled onto the same single worker
    let flag = short_done.clone();
    iom.schedule(move || {
        hook::sleep_ms(300);
        flag.store(true, Ordering::Release);
    });

    let started = Instant::now();
    let short_finished_first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(short_finished_first, "short sleep should complete during the long one");
    assert!(started.elapsed() >= Duration::from_millis(700));

    iom.stop();
}

#[test]
fn test_read_timeout_surfaces_etimedout() {
    let iom = IoManager::new(1, false, "timeout-test");

    let mut fds = [0i32; 2];
    let rt = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
    };
    assert_eq!(rt, 0);
    let (hooked_end, peer_end) = (fds[0], fds[1]);
    fd_registry().get(hooked_end, true);

    let (tx, rx) = mpsc::channel();
    iom.schedule(move || {
        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 200_000,
        };
        let rt = unsafe {
            hook::setsockopt(
                hooked_end,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        assert_eq!(rt, 0);

        // No data for a while: the 200ms timeout must fire
        let started = Instant::now();
        let mut buf = [0u8; 16];
        let n = hook::read(hooked_end, &mut buf);
        let e = unsafe { *libc::__errno_location() };
        tx.send((n, e, started.elapsed())).unwrap();

        // Data eventually arrives: the next read succeeds
        let n = hook::read(hooked_end, &mut buf);
        tx.send((n, 0, Duration::ZERO)).unwrap();
    });

    let (n, e, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(n, -1);
    assert_eq!(e, libc::ETIMEDOUT);
    assert!(
        elapsed >= Duration::from_millis(150) && elapsed < Duration::from_secs(2),
        "timeout fired at {:?}",
        elapsed
    );

    let rt = unsafe { libc::write(peer_end, b"ping".as_ptr() as *const libc::c_void, 4) };
    assert_eq!(rt, 4);
    let (n, _, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(n, 4);

    unsafe {
        libc::close(peer_end);
    }
    iom.stop();
}

fn spawn_echo_server(iom: &IoManager, port: u16) {
    iom.schedule(move || {
        let listener = net::Listener::bind(port).unwrap();
        loop {
            match listener.accept() {
                Ok(stream) => {
                    let iom = IoManager::current().unwrap();
                    iom.schedule(move || {
                        let mut buf = [0u8; 4096];
                        loop {
                            let n = stream.read(&mut buf);
                            if n <= 0 {
                                return;
                            }
                            if stream.write_all(&buf[..n as usize]) < 0 {
                                return;
                            }
                        }
                    });
                }
                Err(_) => return,
            }
        }
    });
}

#[test]
fn test_echo_server_multiplexes_many_clients_on_one_worker() {
    const PORT: u16 = 19701;
    let iom = IoManager::new(1, false, "echo-test");
    spawn_echo_server(&iom, PORT);
    std::thread::sleep(Duration::from_millis(200));

    let mut clients = Vec::new();
    for i in 0..100 {
        clients.push(std::thread::spawn(move || {
            let mut conn = std::net::TcpStream::connect(("127.0.0.1", PORT)).unwrap();
            conn.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            let msg = format!("hello from client {}", i);
            conn.write_all(msg.as_bytes()).unwrap();
            let mut buf = vec![0u8; msg.len()];
            conn.read_exact(&mut buf).unwrap();
            assert_eq!(buf, msg.as_bytes());
        }));
    }
    for c in clients {
        c.join().unwrap();
    }
    // The acceptor keeps one registration pending forever, so the manager
    // is intentionally left running.
}

#[test]
fn test_net_stream_connect_roundtrip() {
    const PORT: u16 = 19702;
    let iom = IoManager::new(2, false, "net-test");
    spawn_echo_server(&iom, PORT);
    std::thread::sleep(Duration::from_millis(200));

    let (tx, rx) = mpsc::channel();
    iom.schedule(move || {
        let stream = net::Stream::connect([127, 0, 0, 1], PORT, 2000).unwrap();
        assert_eq!(stream.write_all(b"roundtrip"), 9);
        let mut buf = [0u8; 9];
        let mut got = 0;
        while got < buf.len() {
            let n = stream.read(&mut buf[got..]);
            assert!(n > 0);
            got += n as usize;
        }
        tx.send(buf.to_vec()).unwrap();
    });

    let echoed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(echoed, b"roundtrip");
}
