//! Payload codec for protocol frames.
//!
//! Opaque payloads are zlib-compressed then base64-encoded. Compression
//! is unconditional: the resulting alphabet is what makes the payload
//! safe to ride through a terminal, not the size win.

use std::io::{Read, Write};

use base64::prelude::*;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Result, TrzszError};

/// Compress and encode a byte run for a protocol line.
pub fn encode_bytes(buf: &[u8]) -> String {
    let mut z = ZlibEncoder::new(
        Vec::with_capacity(buf.len() / 2 + 0x20),
        Compression::default(),
    );
    // writing into a Vec cannot fail
    let _ = z.write_all(buf);
    BASE64_STANDARD.encode(z.finish().unwrap_or_default())
}

pub fn encode_string(s: &str) -> String {
    encode_bytes(s.as_bytes())
}

/// Reverse of [`encode_bytes`]; rejects anything that is not
/// base64-wrapped zlib.
pub fn decode_string(s: &str) -> Result<Vec<u8>> {
    let compressed = BASE64_STANDARD
        .decode(s)
        .map_err(|e| TrzszError::Fatal(format!("base64 decode error: {}", e)))?;
    let mut z = ZlibDecoder::new(compressed.as_slice());
    let mut buf = Vec::with_capacity(compressed.len() << 2);
    z.read_to_end(&mut buf)
        .map_err(|e| TrzszError::Fatal(format!("zlib decode error: {}", e)))?;
    Ok(buf)
}
