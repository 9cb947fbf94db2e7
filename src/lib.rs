//! A single-threaded, non-blocking I/O reactor: sockets, timers, a
//! cross-thread event queue, a per-connection state machine, and a
//! configurable message-framing ("unpack") engine, plus transparent
//! upstream bridging for building simple TCP/UDP proxies.
//!
//! The crate's surface is intentionally small and centers on [`Reactor`]:
//! construct one, `listen`/`connect`/`adopt_fd` to register handles,
//! install callbacks with `set_read_cb`/`set_write_cb`/etc., then drive it
//! with `run` or `run_once`. Everything else (timers, framing, upstream
//! bridging) hangs off that same handle.

mod clock;
mod config;
mod error;
mod event_queue;
mod handle;
mod reactor;
mod timer;
mod tls;
mod unpack;
mod write_queue;

pub use clock::{MonotonicClock, Nanos};
pub use config::{Priority, ReactorConfig, ReactorFlags};
pub use error::{ReactorError, Result};
pub use event_queue::{EventQueueHandle, PostedFn};
pub use handle::{AcceptCb, CloseCb, ConnectCb, HandleIo, HandleKind, HeartbeatFn, ReadCb, ReadMode, WriteCb};
pub use reactor::Reactor;
pub use timer::{RepeatCount, TimerId, TimerKind};
pub use tls::{TlsIoResult, TlsSession};
pub use unpack::{Endian, LengthFieldCoding, UnpackMode, UnpackSetting};

pub use mio::Token;
