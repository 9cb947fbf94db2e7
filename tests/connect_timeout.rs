//! A connect attempt to an address that will never respond (TEST-NET-3,
//! RFC 5737) must fail with `ETIMEDOUT` via the connect-timeout timer
//! rather than hang forever, and the close callback must fire exactly
//! once.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hflux_reactor::{Reactor, ReactorConfig};

mod common;

#[test]
fn connect_timeout_fires_etimedout() {
    common::init_tracing();
    let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();

    // 203.0.113.1 is documentation-reserved (RFC 5737) and unroutable on
    // any real network, so the SYN is dropped rather than rejected.
    let addr: SocketAddr = "203.0.113.1:1".parse().unwrap();
    let token = reactor.connect(addr).unwrap();
    reactor.set_connect_timeout(token, 100);

    let close_count = Arc::new(Mutex::new(0u32));
    let seen_error = Arc::new(Mutex::new(None));
    let close_count_cb = Arc::clone(&close_count);
    let seen_error_cb = Arc::clone(&seen_error);
    reactor.set_close_cb(
        token,
        Box::new(move |io| {
            *close_count_cb.lock().unwrap() += 1;
            *seen_error_cb.lock().unwrap() = io.error();
        }),
    );

    let deadline = Instant::now() + Duration::from_millis(1500);
    while Instant::now() < deadline && reactor.handle_count() > 0 {
        reactor.run_once().unwrap();
    }

    assert_eq!(reactor.handle_count(), 0, "handle should have been closed by the timeout");
    assert_eq!(*close_count.lock().unwrap(), 1, "close_cb must fire exactly once");
    assert_eq!(*seen_error.lock().unwrap(), Some(libc::ETIMEDOUT));
}
