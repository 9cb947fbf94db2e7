//! Stateless-per-call, buffer-driven message framing ("unpack" in the
//! original terminology): byte-stream to record-record decoding in three
//! modes.
//!
//! Grounded on `stream.rs`'s `RxState` state machine (`ReadingHeader` /
//! `ReadingPayload`, a hard-coded 4-byte little-endian length field plus an
//! 8-byte timestamp) as the worked example of the length-field mode here
//! generalized to a configurable offset/width/endianness, and on
//! `hevent.c`'s `hio_set_unpack`/`hio_unset_unpack` for validation and
//! default `package_max_length` behavior.

use crate::config::DEFAULT_PACKAGE_MAX_LENGTH;
use crate::error::{ReactorError, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
    /// Network byte order — synonymous with `Big` for every coding this
    /// engine supports.
    Network,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LengthFieldCoding {
    pub endian: Endian,
    pub signed: bool,
}

impl Default for LengthFieldCoding {
    fn default() -> Self {
        Self { endian: Endian::Big, signed: false }
    }
}

#[derive(Clone, Debug)]
pub enum UnpackMode {
    /// Every record is exactly `fixed_length` bytes.
    Fixed { fixed_length: usize },
    /// Records are terminated by a byte sequence; the delivered record
    /// includes the delimiter.
    Delimiter { delimiter: Vec<u8> },
    /// Records carry a length field at `offset`, `bytes` wide, with the
    /// body itself starting at `body_offset` (which must be at least
    /// `offset + bytes`). The delivered record is the body only.
    LengthField { offset: usize, bytes: usize, body_offset: usize, coding: LengthFieldCoding },
}

/// Immutable once attached to a handle, per the data model.
#[derive(Clone, Debug)]
pub struct UnpackSetting {
    pub mode: UnpackMode,
    pub package_max_length: usize,
}

impl UnpackSetting {
    pub fn fixed(fixed_length: usize) -> Result<Self> {
        let s = Self { mode: UnpackMode::Fixed { fixed_length }, package_max_length: DEFAULT_PACKAGE_MAX_LENGTH };
        s.validate()?;
        Ok(s)
    }

    pub fn delimiter(delimiter: Vec<u8>) -> Result<Self> {
        let s = Self {
            mode: UnpackMode::Delimiter { delimiter },
            package_max_length: DEFAULT_PACKAGE_MAX_LENGTH,
        };
        s.validate()?;
        Ok(s)
    }

    pub fn length_field(
        offset: usize,
        bytes: usize,
        body_offset: usize,
        coding: LengthFieldCoding,
    ) -> Result<Self> {
        let s = Self {
            mode: UnpackMode::LengthField { offset, bytes, body_offset, coding },
            package_max_length: DEFAULT_PACKAGE_MAX_LENGTH,
        };
        s.validate()?;
        Ok(s)
    }

    pub fn with_package_max_length(mut self, max: usize) -> Result<Self> {
        self.package_max_length = if max == 0 { DEFAULT_PACKAGE_MAX_LENGTH } else { max };
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        match &self.mode {
            UnpackMode::Fixed { fixed_length } => {
                if *fixed_length == 0 || *fixed_length > self.package_max_length {
                    return Err(ReactorError::PackageTooLarge {
                        len: *fixed_length,
                        max: self.package_max_length,
                    });
                }
            }
            UnpackMode::Delimiter { delimiter } => {
                if delimiter.is_empty() {
                    return Err(ReactorError::InvalidUnpackSetting { body_offset: 0, min: 1 });
                }
            }
            UnpackMode::LengthField { offset, bytes, body_offset, .. } => {
                let min = offset + bytes;
                if *body_offset < min {
                    return Err(ReactorError::InvalidUnpackSetting { body_offset: *body_offset, min });
                }
                if !matches!(bytes, 1 | 2 | 4 | 8) {
                    return Err(ReactorError::InvalidUnpackSetting { body_offset: *body_offset, min });
                }
            }
        }
        Ok(())
    }

    /// The buffer size a handle attaching this setting should allocate, per
    /// `hio_set_unpack`: exactly `fixed_length` for FIXED, the shared
    /// default bufsize otherwise (it grows on demand for large
    /// length-prefixed bodies).
    pub fn initial_bufsize(&self, default_bufsize: usize) -> usize {
        match self.mode {
            UnpackMode::Fixed { fixed_length } => fixed_length,
            _ => default_bufsize,
        }
    }

    /// Attempts to pull one complete record out of the front of `buf`.
    /// On success the record's bytes (and any header it carries) are
    /// drained from `buf`, shifting residue to the front; returns `Ok(None)`
    /// if not enough bytes have accumulated yet.
    pub fn try_extract(&self, buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
        match &self.mode {
            UnpackMode::Fixed { fixed_length } => {
                if buf.len() < *fixed_length {
                    return Ok(None);
                }
                Ok(Some(buf.drain(..*fixed_length).collect()))
            }

            UnpackMode::Delimiter { delimiter } => {
                match find_subslice(buf, delimiter) {
                    Some(pos) => {
                        let total = pos + delimiter.len();
                        if total > self.package_max_length {
                            return Err(ReactorError::PackageTooLarge { len: total, max: self.package_max_length });
                        }
                        Ok(Some(buf.drain(..total).collect()))
                    }
                    None => {
                        if buf.len() > self.package_max_length {
                            return Err(ReactorError::PackageTooLarge {
                                len: buf.len(),
                                max: self.package_max_length,
                            });
                        }
                        Ok(None)
                    }
                }
            }

            UnpackMode::LengthField { offset, bytes, body_offset, coding } => {
                let header_end = offset + bytes;
                if buf.len() < header_end {
                    return Ok(None);
                }
                let value = decode_length(&buf[*offset..header_end], *coding)?;
                if value < 0 {
                    return Err(ReactorError::InvalidLengthField(value));
                }
                let body_len = value as usize;
                let total = body_offset + body_len;
                if total > self.package_max_length {
                    return Err(ReactorError::PackageTooLarge { len: total, max: self.package_max_length });
                }
                if buf.len() < total {
                    return Ok(None);
                }
                let record = buf[*body_offset..total].to_vec();
                buf.drain(..total);
                Ok(Some(record))
            }
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn decode_length(field: &[u8], coding: LengthFieldCoding) -> Result<i64> {
    let be = matches!(coding.endian, Endian::Big | Endian::Network);
    let mut raw: u64 = 0;
    if be {
        for &b in field {
            raw = (raw << 8) | b as u64;
        }
    } else {
        for (i, &b) in field.iter().enumerate() {
            raw |= (b as u64) << (8 * i);
        }
    }

    if coding.signed {
        let shift = 64 - field.len() * 8;
        Ok(((raw << shift) as i64) >> shift)
    } else {
        Ok(raw as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_length_delivers_exact_chunks() {
        let setting = UnpackSetting::fixed(3).unwrap();
        let mut buf = vec![1, 2, 3, 4, 5];
        let rec = setting.try_extract(&mut buf).unwrap().unwrap();
        assert_eq!(rec, vec![1, 2, 3]);
        assert_eq!(buf, vec![4, 5]);
        assert!(setting.try_extract(&mut buf).unwrap().is_none());
    }

    #[test]
    fn delimiter_includes_terminator_and_restarts() {
        let setting = UnpackSetting::delimiter(b"\r\n".to_vec()).unwrap();
        let mut buf = b"hello\r\nworl".to_vec();
        let rec = setting.try_extract(&mut buf).unwrap().unwrap();
        assert_eq!(rec, b"hello\r\n");
        assert_eq!(buf, b"worl");
        assert!(setting.try_extract(&mut buf).unwrap().is_none());
    }

    #[test]
    fn length_field_big_endian_two_frames() {
        let setting = UnpackSetting::length_field(0, 2, 2, LengthFieldCoding { endian: Endian::Big, signed: false })
            .unwrap()
            .with_package_max_length(1024)
            .unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0x00, 0x05]);
        buf.extend_from_slice(b"HELLO");
        buf.extend_from_slice(&[0x00, 0x03]);
        buf.extend_from_slice(b"HI!");

        let rec1 = setting.try_extract(&mut buf).unwrap().unwrap();
        assert_eq!(rec1, b"HELLO");
        let rec2 = setting.try_extract(&mut buf).unwrap().unwrap();
        assert_eq!(rec2, b"HI!");
        assert!(buf.is_empty());
    }

    #[test]
    fn oversize_package_is_rejected() {
        let setting = UnpackSetting::length_field(0, 2, 2, LengthFieldCoding::default())
            .unwrap()
            .with_package_max_length(4)
            .unwrap();
        let mut buf = vec![0x00, 0x05];
        buf.extend_from_slice(b"HELLO");
        let err = setting.try_extract(&mut buf).unwrap_err();
        assert!(matches!(err, ReactorError::PackageTooLarge { .. }));
    }

    #[test]
    fn partial_frame_returns_none_until_complete() {
        let setting = UnpackSetting::length_field(0, 2, 2, LengthFieldCoding::default()).unwrap();
        let mut buf = vec![0x00, 0x05, b'H', b'E'];
        assert!(setting.try_extract(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"LLO");
        assert_eq!(setting.try_extract(&mut buf).unwrap().unwrap(), b"HELLO");
    }
}
