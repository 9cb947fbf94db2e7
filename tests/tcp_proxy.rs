//! Transparent TCP proxy: a client connects to the proxy's listening
//! port, the proxy dials a real backend via `setup_tcp_upstream`, and
//! bytes flow both ways without the client or backend being aware of
//! the relay.

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
fn proxy_relays_both_directions_and_cascades_close() {
    common::init_tracing();
    let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();

    // Real backend: echoes whatever it receives back, reversed, so we can
    // tell backend output apart from a pass-through bug.
    let backend_listener = reactor.listen(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let backend_addr = reactor.local_addr(backend_listener).unwrap();
    reactor.set_accept_cb(
        backend_listener,
        Box::new(|io| {
            let token = io.token();
            io.reactor().set_read_cb(
                token,
                Box::new(|io, data| {
                    let mut reversed = data.to_vec();
                    reversed.reverse();
                    let _ = io.write(&reversed);
                }),
            );
        }),
    );

    // Proxy: accepts clients and bridges each one to its own fresh
    // connection to the backend.
    let proxy_listener = reactor.listen(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let proxy_addr = reactor.local_addr(proxy_listener).unwrap();
    reactor.set_accept_cb(
        proxy_listener,
        Box::new(move |io| {
            let client_token = io.token();
            io.reactor().setup_tcp_upstream(client_token, backend_addr).expect("dial backend");
        }),
    );

    let client = reactor.connect(proxy_addr).unwrap();
    let received = Arc::new(Mutex::new(Vec::<u8>::new()));
    let received_cb = Arc::clone(&received);
    reactor.set_read_cb(
        client,
        Box::new(move |_io, data| received_cb.lock().unwrap().extend_from_slice(data)),
    );

    // Wait for client, proxy-side accepted socket, and proxy's upstream
    // leg to the backend to all be registered (4 handles total: proxy
    // listener, backend listener, client<->proxy, proxy<->backend — plus
    // the client handle and backend-accepted handle once connected).
    pump(&mut reactor, Duration::from_secs(5), || reactor.handle_count() >= 6);

    reactor.write(client, b"abc").unwrap();
    pump(&mut reactor, Duration::from_secs(5), || !received.lock().unwrap().is_empty());
    assert_eq!(&received.lock().unwrap()[..], b"cba");

    // Closing the client must cascade through the proxy's upstream leg and
    // tear down the backend-accepted connection too, leaving only the two
    // still-listening sockets.
    reactor.close(client);
    pump(&mut reactor, Duration::from_secs(5), || reactor.handle_count() == 2);
}
