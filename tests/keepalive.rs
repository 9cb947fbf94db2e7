//! Keepalive: a silent connection is closed once the keepalive timeout
//! elapses with no read activity, but each read resets the deadline so
//! traffic keeps the connection alive past that timeout.

use std::net::{Ipv4Addr, SocketAddr};
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
fn keepalive_closes_silent_connection() {
    common::init_tracing();
    let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();

    let listener = reactor.listen(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let addr = reactor.local_addr(listener).unwrap();
    reactor.set_accept_cb(
        listener,
        Box::new(|io| {
            io.reactor().set_keepalive_timeout(io.token(), 100);
        }),
    );

    let client = reactor.connect(addr).unwrap();

    // Wait for the server side to accept and arm its keepalive timer.
    pump(&mut reactor, Duration::from_secs(5), || reactor.handle_count() >= 2);

    let client_closed = Arc::new(Mutex::new(false));
    let client_closed_cb = Arc::clone(&client_closed);
    reactor.set_close_cb(client, Box::new(move |_io| *client_closed_cb.lock().unwrap() = true));

    // Nothing is ever written on this connection; the server side should
    // time out, close, and the client observes the peer disconnect.
    pump(&mut reactor, Duration::from_secs(5), || *client_closed.lock().unwrap());
}

#[test]
fn keepalive_resets_on_read() {
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
            io.reactor().set_keepalive_timeout(token, 150);
        }),
    );

    let client = reactor.connect(addr).unwrap();
    pump(&mut reactor, Duration::from_secs(5), || reactor.handle_count() >= 2);

    // Send three pings, each inside the 150ms keepalive window, and
    // confirm the server-side handle survives past the point where a
    // single unrenewed timeout would have fired.
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(350) {
        reactor.write(client, b"ping").unwrap();
        for _ in 0..5 {
            reactor.run_once().unwrap();
        }
        std::thread::sleep(Duration::from_millis(60));
    }

    let server_token = server_token.lock().unwrap().expect("server side must have accepted");
    assert!(!reactor.is_closed(server_token), "keepalive must have been reset by traffic");
}
