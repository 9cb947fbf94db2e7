//! Tunable constants and builder-style configuration, exposed as `pub
//! const` defaults overridable through builders — the same shape as
//! `TcpConnector::with_reconnect_interval` / `with_on_connect_msg` /
//! `with_socket_buf_size` in the teacher's `connector.rs`, rather than an
//! on-disk format or environment variables (neither is in scope).

use bitflags::bitflags;

/// Default size of the reactor's shared read buffer, and the size a
/// private per-handle buffer grows to before unpack buffering takes over.
pub const HLOOP_READ_BUFSIZE: usize = 16 * 1024;

/// Above this size a private read buffer is a shrink candidate once
/// `SMALL_READ_COUNT_THRESHOLD` consecutive deliveries stay under half its
/// size.
pub const READ_BUFSIZE_HIGH_WATER: usize = 1024 * 1024;

/// Default cap on a single framed record, shared by all three unpack
/// modes unless a `UnpackSetting` overrides it.
pub const DEFAULT_PACKAGE_MAX_LENGTH: usize = 1024 * 1024;

/// Upper bound on how long `run()` will block in a single demultiplexer
/// wait when no timer is sooner.
pub const IDLE_MAX_MS: u64 = 10_000;

/// Consecutive small-delivery count that triggers a private buffer
/// shrink (and, symmetrically, a growth once deliveries saturate it).
pub const SMALL_READ_COUNT_THRESHOLD: u32 = 10;

/// Growth/shrink factor applied to a private read buffer.
pub const READBUF_GROW_FACTOR: usize = 2;

/// Bounds the consumed/produced loop driving a `TlsSession` per
/// read/write call, so a session implementation that keeps returning
/// `WantWrite`/`Progress{consumed: 0, ..}` without making progress can't
/// spin the reactor thread forever.
pub const TLS_PROGRESS_ITERATION_LIMIT: u32 = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High,
    Normal,
}

pub const HEVENT_HIGH_PRIORITY: Priority = Priority::High;
pub const HEVENT_NORMAL_PRIORITY: Priority = Priority::Normal;

bitflags! {
    /// Reactor-wide behavior flags, mirroring `HLOOP_FLAG_*` from the
    /// original event loop.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct ReactorFlags: u32 {
        /// `run()` returns once no handles and no timers remain active,
        /// instead of blocking forever waiting for more work.
        const AUTO_FREE = 0b01;
    }
}

/// Construction-time configuration for a [`crate::Reactor`].
#[derive(Clone, Debug)]
pub struct ReactorConfig {
    pub flags: ReactorFlags,
    pub read_bufsize: usize,
    pub idle_max_ms: u64,
    pub events_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            flags: ReactorFlags::empty(),
            read_bufsize: HLOOP_READ_BUFSIZE,
            idle_max_ms: IDLE_MAX_MS,
            events_capacity: 1024,
        }
    }
}

impl ReactorConfig {
    pub fn with_flags(mut self, flags: ReactorFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_read_bufsize(mut self, size: usize) -> Self {
        self.read_bufsize = size;
        self
    }

    pub fn with_idle_max(mut self, ms: u64) -> Self {
        self.idle_max_ms = ms;
        self
    }
}
