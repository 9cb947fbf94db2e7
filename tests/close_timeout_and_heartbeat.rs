//! Two of the four per-handle timers not covered by the other scenario
//! tests: `close_timeout` (graceful close while a write backlog drains)
//! and `heartbeat` (a recurring callback independent of I/O activity).

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hflux_reactor::{Reactor, ReactorConfig};

mod common;

fn pump(reactor: &mut Reactor, for_how_long: Duration, mut until: impl FnMut() -> bool) {
    let deadline = Instant::now() + for_how_long;
    while Instant::now() < deadline {
        reactor.run_once().expect("run_once failed");
        if until() {
            return;
        }
    }
    panic!("pump timed out waiting for condition");
}

#[test]
fn close_timeout_drains_backlog_before_forcing_closed() {
    common::init_tracing();
    let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();

    let listener = reactor.listen(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let addr = reactor.local_addr(listener).unwrap();

    let server_token = Arc::new(Mutex::new(None));
    let server_token_cb = Arc::clone(&server_token);
    reactor.set_accept_cb(
        listener,
        Box::new(move |io| {
            let token = io.token();
            *server_token_cb.lock().unwrap() = Some(token);
            io.reactor().set_close_timeout(token, 100);
            // A payload well past any kernel send-buffer size, so some of
            // it is guaranteed to still be sitting in the write queue
            // once this call returns (the client below never reads).
            let payload = vec![0xABu8; 16 * 1024 * 1024];
            let _ = io.write(&payload);
        }),
    );

    // Connect but never read: the server's writes back up in the kernel
    // send buffer and then in our own write queue.
    let _client = std::net::TcpStream::connect(addr).unwrap();

    pump(&mut reactor, Duration::from_secs(5), || server_token.lock().unwrap().is_some());
    let token = server_token.lock().unwrap().unwrap();

    pump(&mut reactor, Duration::from_secs(5), || reactor.write_queue_bytes(token) > 0);
    assert!(reactor.write_queue_bytes(token) > 0, "backlog must be non-empty before close()");

    reactor.close(token);

    // Closing with a non-empty backlog and a close_timeout configured must
    // not tear the handle down immediately.
    assert!(!reactor.is_closed(token), "handle must stay open to drain, not close synchronously");

    // Once the close_timeout fires, the handle is force-closed regardless
    // of how much backlog remains.
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && !reactor.is_closed(token) {
        reactor.run_once().unwrap();
    }
    assert!(reactor.is_closed(token), "close_timeout must force-close once it fires");
}

#[test]
fn heartbeat_fires_on_schedule_without_io() {
    common::init_tracing();
    let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();

    let listener = reactor.listen(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let addr = reactor.local_addr(listener).unwrap();
    reactor.set_accept_cb(listener, Box::new(|_io| {}));

    let client = reactor.connect(addr).unwrap();
    pump(&mut reactor, Duration::from_secs(5), || reactor.handle_count() >= 2);

    let beats = Arc::new(AtomicU32::new(0));
    let beats_cb = Arc::clone(&beats);
    reactor.set_heartbeat(client, 30);
    reactor.set_heartbeat_cb(client, Box::new(move |_io| { beats_cb.fetch_add(1, Ordering::SeqCst); }));

    // No bytes ever flow on this connection; only the heartbeat timer
    // drives the callback.
    pump(&mut reactor, Duration::from_secs(5), || beats.load(Ordering::SeqCst) >= 3);
}
