//! Diagnostic payload compression for event reason fields.
//!
//! Wire format: `base64(len_le_u32 || gzip(utf8))` where `len_le_u32` is the
//! byte length of the uncompressed UTF-8 text. Plain text that was never
//! compressed passes through [`decompress`] untouched.
//!
//! Reason strings are padded so their length is never a multiple of four.
//! A Base64 payload always is, so a padded plain string can never be
//! mistaken for a compressed one.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use tracing::warn;

/// Maximum length, in characters, of a reason string.
pub const MAX_REASON_LENGTH: usize = 3072;

const LENGTH_HEADER_BYTES: usize = 4;

/// Compress `text` into the wire format.
///
/// Falls back to returning `text` unchanged if the encoder fails, which
/// [`decompress`] then passes through.
pub fn compress(text: &str) -> String {
    let bytes = text.as_bytes();
    match gzip(bytes) {
        Ok(gz) => {
            let mut framed = Vec::with_capacity(LENGTH_HEADER_BYTES + gz.len());
            framed.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            framed.extend_from_slice(&gz);
            STANDARD.encode(framed)
        }
        Err(e) => {
            warn!(error = %e, "Failed to compress payload, sending plain text");
            text.to_string()
        }
    }
}

/// Reverse [`compress`].
///
/// Any input that is not a well-formed compressed payload (bad Base64,
/// short header, corrupt gzip stream, invalid UTF-8) is returned unchanged.
pub fn decompress(payload: &str) -> String {
    try_decompress(payload).unwrap_or_else(|| payload.to_string())
}

fn try_decompress(payload: &str) -> Option<String> {
    let framed = STANDARD.decode(payload).ok()?;
    if framed.len() < LENGTH_HEADER_BYTES {
        return None;
    }
    let (header, body) = framed.split_at(LENGTH_HEADER_BYTES);
    let expected_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;

    let mut out = Vec::with_capacity(expected_len);
    GzDecoder::new(body).read_to_end(&mut out).ok()?;
    if out.len() != expected_len {
        return None;
    }
    String::from_utf8(out).ok()
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Break Base64 block alignment of a plain-text payload.
///
/// If the character count is a multiple of four, appends `.`; at
/// [`MAX_REASON_LENGTH`] the last character is dropped instead. Any other
/// length is returned unchanged.
pub fn make_length_not_multiple_of_four(text: &str) -> String {
    let len = text.chars().count();
    if len % 4 != 0 {
        return text.to_string();
    }
    if len >= MAX_REASON_LENGTH {
        text.chars().take(len - 1).collect()
    } else {
        let mut padded = String::with_capacity(text.len() + 1);
        padded.push_str(text);
        padded.push('.');
        padded
    }
}

/// Cap a reason at [`MAX_REASON_LENGTH`] characters and apply length padding.
pub fn prepare_reason(text: &str) -> String {
    let capped: String = if text.chars().count() > MAX_REASON_LENGTH {
        text.chars().take(MAX_REASON_LENGTH).collect()
    } else {
        text.to_string()
    };
    make_length_not_multiple_of_four(&capped)
}
