//! Length-field framing end to end: a raw byte stream arrives split
//! across several individual writes, and the reactor's unpack engine
//! must reassemble exactly two records regardless of how the bytes land
//! on the wire.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hflux_reactor::{Endian, LengthFieldCoding, Reactor, ReactorConfig, UnpackSetting};

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
fn length_field_frames_reassembled_across_writes() {
    common::init_tracing();
    let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();

    let listener = reactor.listen(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let addr = reactor.local_addr(listener).unwrap();

    let frames: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let frames_cb = Arc::clone(&frames);
    reactor.set_accept_cb(
        listener,
        Box::new(move |io| {
            let token = io.token();
            let setting =
                UnpackSetting::length_field(0, 2, 2, LengthFieldCoding { endian: Endian::Big, signed: false })
                    .unwrap();
            io.reactor().set_unpack(token, setting);
            let frames_inner = Arc::clone(&frames_cb);
            io.reactor().set_read_cb(
                token,
                Box::new(move |_io, data| {
                    frames_inner.lock().unwrap().push(data.to_vec());
                }),
            );
        }),
    );

    let client = reactor.connect(addr).unwrap();
    pump(&mut reactor, Duration::from_secs(5), || reactor.handle_count() >= 2);

    // `00 05 HELLO 00 03 HI!`, split mid-header and mid-body across three
    // writes to exercise the partial-frame accumulation path.
    reactor.write(client, &[0x00, 0x05, b'H', b'E']).unwrap();
    reactor.write(client, b"LLO").unwrap();
    reactor.write(client, &[0x00, 0x03, b'H']).unwrap();
    reactor.write(client, b"I!").unwrap();

    pump(&mut reactor, Duration::from_secs(5), || frames.lock().unwrap().len() == 2);

    let got = frames.lock().unwrap();
    assert_eq!(got[0], b"HELLO");
    assert_eq!(got[1], b"HI!");
}
