//! Binary framing for secure channel messages.
//!
//! Wire format:
//! ```text
//! [magic:4 = "ARKS"][version:1][payload_len:4][ciphertext:N]
//! ```
//! Total header size: 9 bytes. The length is big-endian and describes the
//! ciphertext only, never the header.

use thiserror::Error;

/// Fixed frame magic.
pub const MAGIC: [u8; 4] = *b"ARKS";

/// Current protocol version.
pub const VERSION: u8 = 1;

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 9;

/// Errors that can occur while decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The byte slice is shorter than the fixed header.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The first four bytes are not the protocol magic.
    #[error("bad magic: {0:02X?}")]
    BadMagic([u8; 4]),

    /// The version byte is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The declared payload length does not match the bytes that follow the header.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },

    /// The payload does not fit in the 4-byte length field.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Parsed fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version byte.
    pub version: u8,
    /// Declared ciphertext length.
    pub payload_len: u32,
}

impl FrameHeader {
    /// Parses and validates the 9-byte header.
    ///
    /// Used by stream readers, which read the header first and then exactly
    /// `payload_len` more bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InsufficientData`] for short input,
    /// [`FrameError::BadMagic`] or [`FrameError::UnsupportedVersion`] when the
    /// fixed fields do not match exactly.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::InsufficientData {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic != MAGIC {
            return Err(FrameError::BadMagic(magic));
        }

        let version = bytes[4];
        if version != VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }

        let payload_len = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        Ok(Self {
            version,
            payload_len,
        })
    }

    /// Declared ciphertext length as a `usize`.
    pub fn payload_len(&self) -> usize {
        self.payload_len as usize
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Wraps `payload` in a frame header.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if the payload exceeds `u32::MAX` bytes.
///
/// # Examples
///
/// ```rust
/// use ark_core::protocol::{decode_frame, encode_frame};
///
/// let bytes = encode_frame(b"ciphertext").unwrap();
/// assert_eq!(&bytes[..4], b"ARKS");
/// assert_eq!(decode_frame(&bytes).unwrap(), b"ciphertext");
/// ```
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let payload_len =
        u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&MAGIC);
    buf.push(VERSION);
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decodes one complete frame and returns its payload.
///
/// The slice must hold exactly one frame: a declared length that disagrees
/// with the bytes after the header in either direction is rejected.
///
/// # Errors
///
/// Returns [`FrameError`] if the header is short or invalid or the length
/// does not match.
pub fn decode_frame(bytes: &[u8]) -> Result<&[u8], FrameError> {
    let header = FrameHeader::parse(bytes)?;
    let body = &bytes[HEADER_SIZE..];
    if body.len() != header.payload_len() {
        return Err(FrameError::PayloadLengthMismatch {
            declared: header.payload_len(),
            available: body.len(),
        });
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_writes_magic_version_and_big_endian_length() {
        // Arrange
        let payload = vec![0xAA; 258];

        // Act
        let bytes = encode_frame(&payload).unwrap();

        // Assert
        assert_eq!(&bytes[0..4], b"ARKS");
        assert_eq!(bytes[4], 1);
        assert_eq!(&bytes[5..9], &[0x00, 0x00, 0x01, 0x02]);
        assert_eq!(bytes.len(), HEADER_SIZE + 258);
    }

    #[test]
    fn test_decode_frame_returns_original_payload() {
        let bytes = encode_frame(b"gAAAAABhello").unwrap();

        assert_eq!(decode_frame(&bytes).unwrap(), b"gAAAAABhello");
    }

    #[test]
    fn test_decode_frame_accepts_empty_payload() {
        let bytes = encode_frame(&[]).unwrap();

        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(decode_frame(&bytes).unwrap(), b"");
    }

    #[test]
    fn test_decode_frame_rejects_short_header() {
        let result = decode_frame(b"ARKS\x01\x00");

        assert_eq!(
            result,
            Err(FrameError::InsufficientData {
                needed: HEADER_SIZE,
                available: 6
            })
        );
    }

    #[test]
    fn test_decode_frame_rejects_corrupted_magic_bytes() {
        let original = encode_frame(b"payload").unwrap();

        for i in 0..4 {
            // Arrange
            let mut bytes = original.clone();
            bytes[i] ^= 0xFF;

            // Act
            let result = decode_frame(&bytes);

            // Assert
            assert!(
                matches!(result, Err(FrameError::BadMagic(_))),
                "byte {i} corruption must be rejected"
            );
        }
    }

    #[test]
    fn test_decode_frame_rejects_wrong_version() {
        let mut bytes = encode_frame(b"payload").unwrap();
        bytes[4] = 2;

        assert_eq!(decode_frame(&bytes), Err(FrameError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_decode_frame_rejects_corrupted_length_bytes() {
        let original = encode_frame(b"payload").unwrap();

        for i in 5..9 {
            let mut bytes = original.clone();
            bytes[i] ^= 0x01;

            let result = decode_frame(&bytes);

            assert!(
                matches!(result, Err(FrameError::PayloadLengthMismatch { .. })),
                "length byte {i} corruption must be rejected"
            );
        }
    }

    #[test]
    fn test_decode_frame_rejects_trailing_bytes() {
        let mut bytes = encode_frame(b"abc").unwrap();
        bytes.push(0);

        assert_eq!(
            decode_frame(&bytes),
            Err(FrameError::PayloadLengthMismatch {
                declared: 3,
                available: 4
            })
        );
    }

    #[test]
    fn test_frame_header_parse_reports_declared_length() {
        let bytes = encode_frame(&[7u8; 4096]).unwrap();

        let header = FrameHeader::parse(&bytes[..HEADER_SIZE]).unwrap();

        assert_eq!(header.version, VERSION);
        assert_eq!(header.payload_len(), 4096);
    }
}
