//! The reactor loop: owns the demultiplexer, the timer wheel, the
//! cross-thread event queue, and the registry of live handles, and drives
//! them through one pass per `run_once` call.
//!
//! Grounded on `connector.rs`'s `TcpConnector`/`ConnectionManager` split —
//! one `mio::Poll` plus a linear `Vec<(Token, _)>` registry, a
//! `poll_with`-style single dispatch pass — generalized from
//! TCP-only-with-reconnect to the full handle state machine and the timer
//! wheel / event queue components `connector.rs` doesn't need.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::fd::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, warn};

use crate::clock::{MonotonicClock, Nanos};
use crate::config::{Priority, ReactorConfig, ReactorFlags};
use crate::error::{ReactorError, Result};
use crate::event_queue::{EventQueue, EventQueueHandle, PostedFn};
use crate::handle::{
    AcceptCb, CloseCb, ConnectCb, Handle, HandleIo, HandleState, HeartbeatFn, ReadCb, ReadMode, Role, WriteCb,
    WriteSideOutcome, ReadSideOutcome,
};
use crate::timer::{FiredTimer, RepeatCount, TimerId, TimerKind, TimerWheel};
use crate::tls::TlsSession;
use crate::unpack::UnpackSetting;

const WAKER_TOKEN: Token = Token(usize::MAX);

static NEXT_HANDLE_ID: AtomicU32 = AtomicU32::new(1);

/// Assigns the next process-wide handle id, per the 32-bit atomic counter
/// design note; returns an error once the counter wraps back to the
/// reserved `0` sentinel.
fn next_handle_id() -> Result<u32> {
    let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
    if id == 0 {
        return Err(ReactorError::IdCounterWrapped);
    }
    Ok(id)
}

type UserTimerCb = Box<dyn FnMut(&mut Reactor, TimerId) + Send>;

/// Single-threaded, non-blocking I/O reactor. Exactly one thread may drive
/// a given instance (see `run`/`run_once`); other threads interact only
/// through an [`EventQueueHandle`] obtained from [`Reactor::event_queue_handle`].
pub struct Reactor {
    poll: Poll,
    registry: Registry,
    events: Events,
    waker: Arc<Waker>,

    handles: Vec<(Token, Handle)>,
    next_token: usize,

    timers: TimerWheel,
    user_timers: HashMap<TimerId, UserTimerCb>,
    event_queue: EventQueue,

    clock: MonotonicClock,
    now: Nanos,

    config: ReactorConfig,
    stopped: bool,

    /// Reused scratch buffer handed to handles that don't own a private
    /// read buffer (the `alloced_readbuf`-false path).
    shared_buf: Vec<u8>,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> Result<Self> {
        let poll = Poll::new().map_err(ReactorError::Io)?;
        let registry = poll.registry().try_clone().map_err(ReactorError::Io)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(ReactorError::Io)?);
        let events = Events::with_capacity(config.events_capacity);
        let clock = MonotonicClock::default();
        let now = clock.now();

        Ok(Self {
            poll,
            registry,
            events,
            event_queue: EventQueue::new(Arc::clone(&waker)),
            waker,
            handles: Vec::new(),
            next_token: 0,
            timers: TimerWheel::new(),
            user_timers: HashMap::new(),
            clock,
            now,
            shared_buf: Vec::with_capacity(config.read_bufsize),
            config,
            stopped: false,
        })
    }

    pub fn now(&self) -> Nanos {
        self.now
    }

    fn update_time(&mut self) {
        self.now = self.clock.now();
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// A cloneable handle any thread may use to post work back onto this
    /// reactor's thread.
    pub fn event_queue_handle(&self) -> EventQueueHandle {
        self.event_queue.handle()
    }

    pub fn post_event(&self, priority: Priority, callback: PostedFn) {
        self.event_queue.post(priority, callback);
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    pub(crate) fn handle(&self, token: Token) -> Option<&Handle> {
        self.handles.iter().find(|(t, _)| *t == token).map(|(_, h)| h)
    }

    pub(crate) fn handle_mut(&mut self, token: Token) -> Option<&mut Handle> {
        self.handles.iter_mut().find(|(t, _)| *t == token).map(|(_, h)| h)
    }

    fn index_of(&self, token: Token) -> Option<usize> {
        self.handles.iter().position(|(t, _)| *t == token)
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn peer_addr(&self, token: Token) -> Option<SocketAddr> {
        self.handle(token).and_then(Handle::peer_addr)
    }

    pub fn local_addr(&self, token: Token) -> Option<SocketAddr> {
        self.handle(token).and_then(Handle::local_addr)
    }

    pub fn last_error(&self, token: Token) -> Option<i32> {
        self.handle(token).and_then(Handle::error)
    }

    pub fn write_queue_bytes(&self, token: Token) -> usize {
        self.handle(token).map(Handle::write_queue_bytes).unwrap_or(0)
    }

    pub fn is_closed(&self, token: Token) -> bool {
        self.handle(token).map(Handle::is_closed).unwrap_or(true)
    }

    pub fn kind(&self, token: Token) -> Option<crate::handle::HandleKind> {
        self.handle(token).map(Handle::kind)
    }

    pub fn set_context(&mut self, token: Token, ctx: Box<dyn std::any::Any + Send>) {
        if let Some(h) = self.handle_mut(token) {
            h.set_context(ctx);
        }
    }

    pub fn context(&self, token: Token) -> Option<&(dyn std::any::Any + Send)> {
        self.handle(token).and_then(Handle::context)
    }

    // ---- listen / connect / accept --------------------------------------

    pub fn listen(&mut self, addr: SocketAddr) -> Result<Token> {
        let mut listener = TcpListener::bind(addr).map_err(ReactorError::Io)?;
        let token = self.alloc_token();
        self.registry.register(&mut listener, token, Interest::READABLE).map_err(ReactorError::Io)?;
        let id = next_handle_id()?;
        self.handles.push((token, Handle::from_listener(id, token, listener)));
        Ok(token)
    }

    pub fn connect(&mut self, addr: SocketAddr) -> Result<Token> {
        let stream = TcpStream::connect(addr).map_err(ReactorError::Io)?;
        let token = self.alloc_token();
        let id = next_handle_id()?;
        let mut handle = Handle::from_tcp_stream(id, token, stream, Role::Outbound, addr).map_err(ReactorError::Io)?;
        handle.register_connecting(&self.registry).map_err(ReactorError::Io)?;
        self.handles.push((token, handle));
        Ok(token)
    }

    #[cfg(unix)]
    pub fn adopt_fd(&mut self, fd: RawFd) -> Result<Token> {
        let token = self.alloc_token();
        let id = next_handle_id()?;
        let mut handle = Handle::from_raw_fd(id, token, fd);
        handle.register(&self.registry).map_err(ReactorError::Io)?;
        self.handles.push((token, handle));
        Ok(token)
    }

    /// Wraps an already-listening socket fd as a Listener handle on this
    /// reactor, the multi-acceptor shape from `haccept()`: N reactor
    /// threads each accept from one shared listening fd, connections
    /// distributed across them by the kernel's accept queue. The fd is
    /// `dup`'d first so this reactor owns an independent descriptor —
    /// this reactor closing its listener (or exiting) doesn't tear down
    /// the socket out from under the others sharing it.
    #[cfg(unix)]
    pub fn adopt_listener_fd(&mut self, fd: RawFd) -> Result<Token> {
        let dup_fd = unsafe { libc::dup(fd) };
        if dup_fd < 0 {
            return Err(ReactorError::Io(io::Error::last_os_error()));
        }
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(dup_fd) };
        std_listener.set_nonblocking(true).map_err(ReactorError::Io)?;
        let mut listener = TcpListener::from_std(std_listener);
        let token = self.alloc_token();
        self.registry.register(&mut listener, token, Interest::READABLE).map_err(ReactorError::Io)?;
        let id = next_handle_id()?;
        self.handles.push((token, Handle::from_listener(id, token, listener)));
        Ok(token)
    }

    fn dispatch_accept(&mut self, listener_token: Token) {
        loop {
            let Some(idx) = self.index_of(listener_token) else { return };
            match self.handles[idx].1.accept_one() {
                Ok((stream, peer_addr)) => {
                    let token = self.alloc_token();
                    let id = match next_handle_id() {
                        Ok(id) => id,
                        Err(e) => {
                            warn!(?e, "could not assign id to accepted connection");
                            return;
                        }
                    };
                    let mut handle = match Handle::from_tcp_stream(id, token, stream, Role::Inbound, peer_addr) {
                        Ok(h) => h,
                        Err(e) => {
                            warn!(?e, "failed constructing inbound handle");
                            continue;
                        }
                    };
                    if let Err(e) = handle.register(&self.registry) {
                        warn!(?e, "failed to register inbound handle");
                        continue;
                    }
                    self.handles.push((token, handle));
                    self.invoke_accept_cb(listener_token, token);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!(?e, "accept error");
                    return;
                }
            }
        }
    }

    fn dispatch_connect_completion(&mut self, token: Token) {
        let Some(idx) = self.index_of(token) else { return };
        let status = self.handles[idx].1.take_socket_error();
        match status {
            Ok(None) => {
                if let Some(ctid) = self.handles[idx].1.timers.connect_timeout.take() {
                    self.timers.cancel(ctid);
                }
                if let Err(e) = self.handles[idx].1.finish_connect(&self.registry) {
                    warn!(?e, "finish_connect failed");
                    self.close_at_index(idx);
                    return;
                }
                self.invoke_connect_cb(token);
            }
            Ok(Some(e)) => {
                self.handles[idx].1.error = e.raw_os_error();
                self.close_at_index(idx);
            }
            Err(e) => {
                self.handles[idx].1.error = e.raw_os_error();
                self.close_at_index(idx);
            }
        }
    }

    // ---- read / write dispatch -------------------------------------------

    fn dispatch_token(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(idx) = self.index_of(token) else { return };
        if self.handles[idx].1.role == Role::Listener {
            if readable {
                self.dispatch_accept(token);
            }
            return;
        }
        if self.handles[idx].1.connecting {
            if writable {
                self.dispatch_connect_completion(token);
            }
            return;
        }
        if readable {
            self.dispatch_read(token);
            if self.index_of(token).is_none() {
                return;
            }
        }
        if writable {
            self.dispatch_write(token);
        }
    }

    fn dispatch_read(&mut self, token: Token) {
        let Some(idx) = self.index_of(token) else { return };
        let mut records: Vec<Vec<u8>> = Vec::new();
        let outcome =
            self.handles[idx].1.poll_read(&mut self.shared_buf, &self.registry, |data| records.push(data.to_vec()));

        let had_data = !records.is_empty();
        for record in records {
            if self.index_of(token).is_none() {
                break;
            }
            self.invoke_read_cb(token, &record);
        }

        if had_data {
            self.reset_keepalive(token);
        }

        let Some(idx) = self.index_of(token) else { return };
        match outcome {
            ReadSideOutcome::Ok => {}
            ReadSideOutcome::PeerClosed => {
                self.handles[idx].1.error = None;
                self.close_at_index(idx);
            }
            ReadSideOutcome::Fatal(e) => {
                self.handles[idx].1.error = e.raw_os_error();
                self.close_at_index(idx);
            }
            ReadSideOutcome::ProtocolError(e) => {
                debug!(?e, "framing violation, closing");
                self.handles[idx].1.error = Some(libc::EPROTO);
                self.close_at_index(idx);
            }
        }
    }

    fn reset_keepalive(&mut self, token: Token) {
        let Some(idx) = self.index_of(token) else { return };
        let Some(kid) = self.handles[idx].1.timers.keepalive else { return };
        let ms = self.handles[idx].1.timers.keepalive_ms;
        let deadline = self.now.saturating_add(Nanos::from_millis(ms));
        self.timers.reset(kid, deadline);
    }

    fn dispatch_write(&mut self, token: Token) {
        let Some(idx) = self.index_of(token) else { return };
        let (outcome, flushed) = self.handles[idx].1.drain_writes(&self.registry);
        if let WriteSideOutcome::Fatal(e) = outcome {
            self.handles[idx].1.error = e.raw_os_error();
            self.close_at_index(idx);
            return;
        }

        let is_closing = self.handles[idx].1.state == HandleState::Closing;
        let drained = self.handles[idx].1.write_queue_bytes() == 0;

        if let Some(chunk) = flushed {
            self.invoke_write_cb(token, &chunk);
        }

        if is_closing && drained {
            if let Some(idx2) = self.index_of(token) {
                self.close_at_index(idx2);
            }
        }
    }

    // ---- write / close API ------------------------------------------------

    pub fn write(&mut self, token: Token, buf: &[u8]) -> Result<()> {
        let registry = &self.registry;
        let Some(idx) = self.index_of(token) else { return Err(ReactorError::UnknownHandle(token)) };
        let result = self.handles[idx].1.write(registry, buf);
        if result.is_err() {
            // Route through `close`, not `close_at_index`, so a write that
            // fails from inside this handle's own callback (e.g. an echo
            // read_cb writing back to itself) defers teardown instead of
            // freeing the handle out from under its caller.
            self.close(token);
        }
        result
    }

    /// Idempotent close. If called while the handle's own callback is
    /// executing, defers the actual teardown until that callback returns
    /// (the reentrant-free hazard from the design notes), instead of
    /// freeing the handle out from under its own caller.
    pub fn close(&mut self, token: Token) {
        let Some(idx) = self.index_of(token) else { return };
        if self.handles[idx].1.in_callback {
            self.handles[idx].1.close_requested = true;
            return;
        }
        let has_backlog = self.handles[idx].1.write_queue_bytes() > 0;
        let has_close_timeout = self.handles[idx].1.timers.close_timeout.is_some();
        if has_backlog && has_close_timeout {
            self.handles[idx].1.state = HandleState::Closing;
            return;
        }
        self.close_at_index(idx);
    }

    fn close_at_index(&mut self, idx: usize) {
        if self.handles[idx].1.state == HandleState::Closed {
            return;
        }
        let token = self.handles[idx].0;
        self.handles[idx].1.shutdown(&self.registry);
        self.timers.cancel_owned_by(token);
        if let Some(ctid) = self.handles[idx].1.timers.connect_timeout.take() {
            self.timers.cancel(ctid);
        }
        if let Some(ktid) = self.handles[idx].1.timers.keepalive.take() {
            self.timers.cancel(ktid);
        }
        if let Some(htid) = self.handles[idx].1.timers.heartbeat.take() {
            self.timers.cancel(htid);
        }

        let upstream = self.handles[idx].1.upstream.take();

        if !self.handles[idx].1.close_cb_fired {
            self.handles[idx].1.close_cb_fired = true;
            if let Some(mut cb) = self.handles[idx].1.callbacks.close.take() {
                let mut io = HandleIo { reactor: self, token };
                cb(&mut io);
            }
        }

        if let Some(idx2) = self.index_of(token) {
            self.handles.swap_remove(idx2);
        }

        if let Some(partner) = upstream {
            if let Some(h) = self.handle_mut(partner) {
                h.upstream = None;
            }
            self.close(partner);
        }
    }

    // ---- callback installation --------------------------------------------

    pub fn set_read_cb(&mut self, token: Token, cb: ReadCb) {
        if let Some(h) = self.handle_mut(token) {
            h.callbacks.read = Some(cb);
        }
    }

    pub fn set_write_cb(&mut self, token: Token, cb: WriteCb) {
        if let Some(h) = self.handle_mut(token) {
            h.callbacks.write = Some(cb);
        }
    }

    pub fn set_accept_cb(&mut self, token: Token, cb: AcceptCb) {
        if let Some(h) = self.handle_mut(token) {
            h.callbacks.accept = Some(cb);
        }
    }

    pub fn set_connect_cb(&mut self, token: Token, cb: ConnectCb) {
        if let Some(h) = self.handle_mut(token) {
            h.callbacks.connect = Some(cb);
        }
    }

    pub fn set_close_cb(&mut self, token: Token, cb: CloseCb) {
        if let Some(h) = self.handle_mut(token) {
            h.callbacks.close = Some(cb);
        }
    }

    fn invoke_accept_cb(&mut self, listener_token: Token, new_token: Token) {
        let Some(idx) = self.index_of(listener_token) else { return };
        let Some(mut cb) = self.handles[idx].1.callbacks.accept.take() else { return };
        {
            let mut io = HandleIo { reactor: self, token: new_token };
            cb(&mut io);
        }
        if let Some(idx2) = self.index_of(listener_token) {
            self.handles[idx2].1.callbacks.accept = Some(cb);
        }
    }

    fn invoke_connect_cb(&mut self, token: Token) {
        let Some(idx) = self.index_of(token) else { return };
        let Some(mut cb) = self.handles[idx].1.callbacks.connect.take() else { return };
        self.begin_callback(token);
        {
            let mut io = HandleIo { reactor: self, token };
            cb(&mut io);
        }
        if let Some(idx2) = self.index_of(token) {
            self.handles[idx2].1.callbacks.connect = Some(cb);
        }
        self.end_callback(token);
    }

    fn invoke_read_cb(&mut self, token: Token, data: &[u8]) {
        let Some(idx) = self.index_of(token) else { return };
        let Some(mut cb) = self.handles[idx].1.callbacks.read.take() else { return };
        self.begin_callback(token);
        {
            let mut io = HandleIo { reactor: self, token };
            cb(&mut io, data);
        }
        if let Some(idx2) = self.index_of(token) {
            self.handles[idx2].1.callbacks.read = Some(cb);
        }
        self.end_callback(token);
    }

    fn invoke_write_cb(&mut self, token: Token, chunk: &[u8]) {
        let Some(idx) = self.index_of(token) else { return };
        let Some(mut cb) = self.handles[idx].1.callbacks.write.take() else { return };
        self.begin_callback(token);
        {
            let mut io = HandleIo { reactor: self, token };
            cb(&mut io, chunk);
        }
        if let Some(idx2) = self.index_of(token) {
            self.handles[idx2].1.callbacks.write = Some(cb);
        }
        self.end_callback(token);
    }

    fn invoke_heartbeat(&mut self, token: Token) {
        let Some(idx) = self.index_of(token) else { return };
        let Some(mut cb) = self.handles[idx].1.callbacks.heartbeat.take() else { return };
        self.begin_callback(token);
        {
            let mut io = HandleIo { reactor: self, token };
            cb(&mut io);
        }
        if let Some(idx2) = self.index_of(token) {
            self.handles[idx2].1.callbacks.heartbeat = Some(cb);
        }
        self.end_callback(token);
    }

    fn begin_callback(&mut self, token: Token) {
        if let Some(h) = self.handle_mut(token) {
            h.in_callback = true;
        }
    }

    /// Clears `in_callback` and actions any close requested while the
    /// callback ran, instead of freeing the handle out from under its own
    /// caller.
    fn end_callback(&mut self, token: Token) {
        let mut needs_close = false;
        if let Some(h) = self.handle_mut(token) {
            h.in_callback = false;
            if h.close_requested {
                h.close_requested = false;
                needs_close = true;
            }
        }
        if needs_close {
            self.close(token);
        }
    }

    // ---- main loop ---------------------------------------------------------

    /// Runs until `stop()` is called, or (with `ReactorFlags::AUTO_FREE`)
    /// until no handles or timers remain. Grounded on `connector.rs`'s
    /// `run`/`poll_once` split: a thin outer loop around a single-pass
    /// inner function so tests can drive one iteration at a time.
    pub fn run(&mut self) -> Result<()> {
        self.stopped = false;
        while !self.stopped {
            self.run_once()?;
            if self.config.flags.contains(ReactorFlags::AUTO_FREE)
                && self.handles.is_empty()
                && self.timers.is_empty()
                && self.event_queue.is_empty()
            {
                break;
            }
        }
        Ok(())
    }

    /// Waits for at most one demultiplexer pass, dispatches whatever it
    /// returned, fires due timers, and drains the cross-thread event
    /// queue. Exposed directly so integration tests can step the loop
    /// deterministically instead of calling the blocking `run()`.
    pub fn run_once(&mut self) -> Result<()> {
        let wait = self.compute_wait_ms();
        match self.poll.poll(&mut self.events, wait) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(ReactorError::Io(e)),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .filter(|ev| ev.token() != WAKER_TOKEN)
            .map(|ev| (ev.token(), ev.is_readable(), ev.is_writable()))
            .collect();

        self.update_time();
        self.fire_due_timers();
        self.drain_event_queue();

        for (token, readable, writable) in ready {
            self.dispatch_token(token, readable, writable);
        }

        Ok(())
    }

    fn compute_wait_ms(&mut self) -> Option<Duration> {
        let cap = self.config.idle_max_ms;
        match self.timers.next_deadline() {
            None => Some(Duration::from_millis(cap)),
            Some(deadline) => {
                let remaining = deadline.saturating_sub(self.now).as_millis();
                Some(Duration::from_millis(remaining.min(cap)))
            }
        }
    }

    fn fire_due_timers(&mut self) {
        let fired: Vec<FiredTimer> = self.timers.pop_due(self.now);
        for timer in fired {
            match timer.kind {
                TimerKind::ConnectTimeout => {
                    let Some(token) = timer.owner else { continue };
                    let Some(idx) = self.index_of(token) else { continue };
                    self.handles[idx].1.error = Some(libc::ETIMEDOUT);
                    self.close_at_index(idx);
                }
                TimerKind::Keepalive => {
                    let Some(token) = timer.owner else { continue };
                    let Some(idx) = self.index_of(token) else { continue };
                    self.handles[idx].1.error = Some(libc::ETIMEDOUT);
                    self.close_at_index(idx);
                }
                TimerKind::CloseTimeout => {
                    let Some(token) = timer.owner else { continue };
                    self.force_close(token);
                }
                TimerKind::Heartbeat => {
                    let Some(token) = timer.owner else { continue };
                    self.invoke_heartbeat(token);
                }
                TimerKind::User => {
                    let Some(mut cb) = self.user_timers.remove(&timer.id) else { continue };
                    cb(self, timer.id);
                    // A repeating user timer keeps the same id in the wheel
                    // (pop_due requeues it); reinstall the callback only if
                    // the wheel still knows about it.
                    if self.timers.contains(timer.id) {
                        self.user_timers.insert(timer.id, cb);
                    }
                }
            }
        }
    }

    fn drain_event_queue(&mut self) {
        let (high, normal) = self.event_queue.take_batch();
        for cb in high {
            cb(self);
        }
        for cb in normal {
            cb(self);
        }
    }

    /// Unconditional close, bypassing the `close_timeout` grace period —
    /// used when the grace period itself has expired.
    fn force_close(&mut self, token: Token) {
        let Some(idx) = self.index_of(token) else { return };
        self.close_at_index(idx);
    }

    // ---- timers -------------------------------------------------------------

    /// Sets (or clears, on `ms == 0`) the connect-timeout timer: fires
    /// `ETIMEDOUT` and closes the handle if `connect()` hasn't completed in
    /// time.
    pub fn set_connect_timeout(&mut self, token: Token, ms: u64) {
        let Some(idx) = self.index_of(token) else { return };
        let existing = self.handles[idx].1.timers.connect_timeout;
        if ms == 0 {
            if let Some(id) = existing {
                self.timers.cancel(id);
            }
            self.handles[idx].1.timers.connect_timeout = None;
            return;
        }
        let deadline = self.now.saturating_add(Nanos::from_millis(ms));
        match existing {
            Some(id) => self.timers.reset(id, deadline),
            None => {
                let id = self.timers.add(deadline, Nanos::ZERO, RepeatCount::Once, Some(token), TimerKind::ConnectTimeout);
                self.handles[idx].1.timers.connect_timeout = Some(id);
            }
        }
    }

    /// Sets (or clears) the close-timeout grace period applied when a
    /// handle with a non-empty write backlog is asked to close.
    pub fn set_close_timeout(&mut self, token: Token, ms: u64) {
        let Some(idx) = self.index_of(token) else { return };
        let existing = self.handles[idx].1.timers.close_timeout;
        if ms == 0 {
            if let Some(id) = existing {
                self.timers.cancel(id);
            }
            self.handles[idx].1.timers.close_timeout = None;
            return;
        }
        let deadline = self.now.saturating_add(Nanos::from_millis(ms));
        match existing {
            Some(id) => self.timers.reset(id, deadline),
            None => {
                let id = self.timers.add(deadline, Nanos::ZERO, RepeatCount::Once, Some(token), TimerKind::CloseTimeout);
                self.handles[idx].1.timers.close_timeout = Some(id);
            }
        }
    }

    /// Sets (or clears) the keepalive timer: reset on every successful
    /// read, firing `ETIMEDOUT` and closing the handle if it goes silent
    /// for the configured duration.
    pub fn set_keepalive_timeout(&mut self, token: Token, ms: u64) {
        let Some(idx) = self.index_of(token) else { return };
        let existing = self.handles[idx].1.timers.keepalive;
        if ms == 0 {
            if let Some(id) = existing {
                self.timers.cancel(id);
            }
            self.handles[idx].1.timers.keepalive = None;
            self.handles[idx].1.timers.keepalive_ms = 0;
            return;
        }
        self.handles[idx].1.timers.keepalive_ms = ms;
        let deadline = self.now.saturating_add(Nanos::from_millis(ms));
        match existing {
            Some(id) => self.timers.reset(id, deadline),
            None => {
                let id = self.timers.add(deadline, Nanos::ZERO, RepeatCount::Once, Some(token), TimerKind::Keepalive);
                self.handles[idx].1.timers.keepalive = Some(id);
            }
        }
    }

    /// Sets (or clears) a recurring heartbeat that fires the installed
    /// heartbeat callback every `ms` milliseconds regardless of I/O
    /// activity.
    pub fn set_heartbeat(&mut self, token: Token, ms: u64) {
        let Some(idx) = self.index_of(token) else { return };
        let existing = self.handles[idx].1.timers.heartbeat;
        if ms == 0 {
            if let Some(id) = existing {
                self.timers.cancel(id);
            }
            self.handles[idx].1.timers.heartbeat = None;
            return;
        }
        let interval = Nanos::from_millis(ms);
        let deadline = self.now.saturating_add(interval);
        match existing {
            Some(id) => self.timers.reset(id, deadline),
            None => {
                let id = self.timers.add(deadline, interval, RepeatCount::Forever, Some(token), TimerKind::Heartbeat);
                self.handles[idx].1.timers.heartbeat = Some(id);
            }
        }
    }

    pub fn set_heartbeat_cb(&mut self, token: Token, cb: HeartbeatFn) {
        if let Some(h) = self.handle_mut(token) {
            h.callbacks.heartbeat = Some(cb);
        }
    }

    /// Adds an application-level timer, independent of any handle.
    pub fn timer_add(
        &mut self,
        ms: u64,
        repeat: RepeatCount,
        callback: impl FnMut(&mut Reactor, TimerId) + Send + 'static,
    ) -> TimerId {
        let deadline = self.now.saturating_add(Nanos::from_millis(ms));
        let interval = Nanos::from_millis(ms);
        let id = self.timers.add(deadline, interval, repeat, None, TimerKind::User);
        self.user_timers.insert(id, Box::new(callback));
        id
    }

    pub fn timer_del(&mut self, id: TimerId) {
        self.timers.cancel(id);
        self.user_timers.remove(&id);
    }

    // ---- read-mode / unpack delegation --------------------------------------

    pub fn read_start(&mut self, token: Token) {
        if let Some(h) = self.handle_mut(token) {
            h.read_start();
        }
    }

    pub fn read_stop(&mut self, token: Token) {
        if let Some(h) = self.handle_mut(token) {
            h.read_stop();
        }
    }

    /// Arms the handle for exactly one successful read delivery, then
    /// disarms itself.
    pub fn read_once(&mut self, token: Token) {
        if let Some(h) = self.handle_mut(token) {
            h.set_read_mode(ReadMode::Once);
            h.read_start();
        }
    }

    /// Delivers only once at least `n` bytes have accumulated, in one
    /// exact-`n`-byte slice.
    pub fn read_until(&mut self, token: Token, n: usize) {
        if let Some(h) = self.handle_mut(token) {
            h.set_read_mode(ReadMode::Until(n));
        }
    }

    /// Attaches a framing setting to the handle. `UnpackSetting`'s own
    /// constructors validate their configuration, so this only wires it
    /// into the handle's read path.
    pub fn set_unpack(&mut self, token: Token, setting: UnpackSetting) {
        if let Some(h) = self.handle_mut(token) {
            h.set_unpack(setting);
        }
    }

    pub fn unset_unpack(&mut self, token: Token) {
        if let Some(h) = self.handle_mut(token) {
            h.unset_unpack();
        }
    }

    pub fn set_tls(&mut self, token: Token, session: Box<dyn TlsSession>) {
        if let Some(h) = self.handle_mut(token) {
            h.set_tls(session);
        }
    }

    /// Flips a handle's [`HandleKind`] to `Ssl` without attaching a
    /// session — pairs with [`Reactor::set_tls`] (or [`Handle::set_tls`]
    /// directly) to actually drive encryption; on its own this only
    /// changes classification.
    pub fn enable_ssl(&mut self, token: Token) {
        if let Some(h) = self.handle_mut(token) {
            h.enable_ssl();
        }
    }

    /// Returns the session attached via `set_tls`, if any.
    pub fn get_ssl(&self, token: Token) -> Option<&dyn TlsSession> {
        self.handle(token).and_then(Handle::get_ssl)
    }

    #[cfg(unix)]
    pub fn fd(&self, token: Token) -> Option<RawFd> {
        self.handle(token).map(Handle::fd)
    }

    /// Adopts a caller-provided buffer as the handle's private read
    /// buffer, replacing the shared one.
    pub fn set_readbuf(&mut self, token: Token, buf: Vec<u8>) {
        if let Some(h) = self.handle_mut(token) {
            h.set_readbuf(buf);
        }
    }

    /// Switches to (or grows) a private read buffer of at least `len`
    /// bytes, detaching the handle from the reactor's shared buffer.
    pub fn alloc_readbuf(&mut self, token: Token, len: usize) {
        if let Some(h) = self.handle_mut(token) {
            h.alloc_readbuf(len);
        }
    }

    /// Frees a handle's private read buffer (if one is safe to drop) and
    /// reverts it to the reactor's shared buffer.
    pub fn free_readbuf(&mut self, token: Token) {
        if let Some(h) = self.handle_mut(token) {
            h.free_readbuf();
        }
    }

    // ---- upstream bridging ---------------------------------------------------

    /// Wires two already-open handles into a symmetric relay: bytes read
    /// on either side are written to the other, and closing either side
    /// cascades to the other through `close_at_index`'s generic `upstream`
    /// handling (no separate `close_cb` installed here, so the cascade
    /// fires exactly once per pair).
    pub fn setup_upstream(&mut self, a: Token, b: Token) {
        if let Some(h) = self.handle_mut(a) {
            h.upstream = Some(b);
        }
        if let Some(h) = self.handle_mut(b) {
            h.upstream = Some(a);
        }
        self.set_read_cb(a, Box::new(move |io, data| {
            let _ = io.write_to(b, data);
        }));
        self.set_read_cb(b, Box::new(move |io, data| {
            let _ = io.write_to(a, data);
        }));
    }

    /// Opens a non-blocking outbound TCP connection to `addr` and bridges
    /// it to `client_token` as a transparent relay, the shape
    /// `setup_tcp_upstream` takes in a proxy built on this reactor. DNS
    /// resolution is the caller's responsibility — `connect` never blocks.
    pub fn setup_tcp_upstream(&mut self, client_token: Token, addr: SocketAddr) -> Result<Token> {
        let upstream_token = self.connect(addr)?;
        self.setup_upstream(client_token, upstream_token);
        Ok(upstream_token)
    }

    /// Binds an unconnected-then-connected UDP socket to `addr` and
    /// bridges it to `client_token`.
    pub fn setup_udp_upstream(&mut self, client_token: Token, addr: SocketAddr) -> Result<Token> {
        let bind_addr: SocketAddr =
            if addr.is_ipv4() { "0.0.0.0:0".parse().unwrap() } else { "[::]:0".parse().unwrap() };
        let socket = UdpSocket::bind(bind_addr).map_err(ReactorError::Io)?;
        socket.connect(addr).map_err(ReactorError::Io)?;
        let token = self.alloc_token();
        let id = next_handle_id()?;
        let mut handle = Handle::from_udp_socket(id, token, socket);
        handle.register(&self.registry).map_err(ReactorError::Io)?;
        self.handles.push((token, handle));
        self.setup_upstream(client_token, token);
        Ok(token)
    }
}
