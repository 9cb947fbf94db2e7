//! Multi-acceptor: several reactor threads accept from one shared
//! listening socket, grounded on
//! `examples/multi-thread/multi-acceptor-threads.c`'s `haccept()` model —
//! each thread runs its own loop and owns whichever connections land on
//! its accept queue.

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hflux_reactor::{Reactor, ReactorConfig};

mod common;

const THREAD_NUM: usize = 4;
const CLIENT_NUM: usize = 12;

#[test]
fn connections_distribute_across_acceptor_threads() {
    common::init_tracing();
    let listener = std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let listen_fd = listener.as_raw_fd();

    let total_accepted = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..THREAD_NUM)
        .map(|_| {
            let total_accepted = Arc::clone(&total_accepted);
            thread::spawn(move || {
                let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
                let acceptor = reactor.adopt_listener_fd(listen_fd).unwrap();
                let total_accepted = Arc::clone(&total_accepted);
                reactor.set_accept_cb(
                    acceptor,
                    Box::new(move |io| {
                        let token = io.token();
                        total_accepted.fetch_add(1, Ordering::SeqCst);
                        io.reactor().set_read_cb(
                            token,
                            Box::new(|io, data| {
                                let _ = io.write(data);
                            }),
                        );
                    }),
                );

                let deadline = Instant::now() + Duration::from_secs(2);
                while Instant::now() < deadline {
                    reactor.run_once().unwrap();
                }
            })
        })
        .collect();

    // Keep the original listener alive (each worker dup'd its own fd) and
    // drive CLIENT_NUM short-lived connections through it.
    for _ in 0..CLIENT_NUM {
        let mut stream = TcpStream::connect(addr).unwrap();
        use std::io::{Read, Write};
        stream.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], b'x');
    }

    for w in workers {
        w.join().unwrap();
    }
    drop(listener);

    assert_eq!(total_accepted.load(Ordering::SeqCst), CLIENT_NUM);
}
