use thiserror::Error;

/// Error surface for fallible setup operations (reactor construction,
/// listen/connect, registry mutation). Per-handle I/O failures are not
/// propagated through this type — they are recorded on the handle
/// (`Handle::error`) and surfaced once via the close callback, per the
/// propagation policy in the design notes.
#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown handle token {0:?}")]
    UnknownHandle(mio::Token),

    #[error("handle {0:?} is a listener and cannot be written to")]
    IsListener(mio::Token),

    #[error("package of {len} bytes exceeds package_max_length of {max}")]
    PackageTooLarge { len: usize, max: usize },

    #[error("negative or invalid length field value: {0}")]
    InvalidLengthField(i64),

    #[error("body_offset ({body_offset}) must be >= length_field_offset + length_field_bytes ({min})")]
    InvalidUnpackSetting { body_offset: usize, min: usize },

    #[error("handle {0:?} already closed")]
    AlreadyClosed(mio::Token),

    #[error("32-bit handle id counter wrapped around")]
    IdCounterWrapped,
}

pub type Result<T> = std::result::Result<T, ReactorError>;
