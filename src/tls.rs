//! TLS is modeled as an opaque collaborator the reactor drives but does not
//! implement: a handle that has had a `TlsSession` attached (`Handle::set_tls`)
//! routes raw ciphertext bytes through it before handing plaintext to the
//! unpack engine or application read callback (`Handle::consume_tls_ciphertext`,
//! called from `poll_read`), and routes plaintext through it before enqueuing
//! ciphertext on the write queue (`Handle::write`). No concrete session type
//! ships here — only the seam, per the scope boundary that actual TLS
//! handshake/record-layer logic is out of scope.

/// Outcome of pushing bytes through a [`TlsSession`] in either direction.
pub enum TlsIoResult {
    /// `consumed` input bytes were processed; `produced` holds bytes ready
    /// to pass downstream (plaintext for a read, ciphertext for a write).
    Progress { consumed: usize, produced: Vec<u8> },
    /// The session needs more input before it can produce anything (e.g.
    /// mid-handshake, or a record split across reads).
    WantRead,
    /// The session has ciphertext it wants written before it can accept
    /// more plaintext.
    WantWrite(Vec<u8>),
    /// The session closed itself (clean close_notify or a fatal alert).
    Closed,
}

/// A bidirectional TLS session attached to one handle.
///
/// Implementations own their handshake state machine; the reactor only
/// calls `on_read`/`on_write` as bytes arrive or are requested and acts on
/// the returned `TlsIoResult`.
pub trait TlsSession: Send {
    /// Feeds raw bytes received from the socket. Returns plaintext ready
    /// for the unpack engine / read callback, or a control outcome.
    fn on_read(&mut self, ciphertext: &[u8]) -> TlsIoResult;

    /// Feeds plaintext the application asked to send. Returns ciphertext
    /// ready to enqueue on the write queue, or a control outcome.
    fn on_write(&mut self, plaintext: &[u8]) -> TlsIoResult;

    /// True once the handshake has completed and `on_write` output is safe
    /// to send as application data rather than handshake traffic.
    fn is_established(&self) -> bool;
}
