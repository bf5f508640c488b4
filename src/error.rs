//! Transfer error taxonomy.
//!
//! Errors fall into three buckets: remote-originated (the peer already
//! knows about them and they must not be echoed back), local sentinels
//! (stop / timeout, sent as `fail` without a stack), and local fatals
//! (sent as `FAIL` with a backtrace captured at construction).

use std::backtrace::Backtrace;

use thiserror::Error;

use crate::codec::{decode_string, encode_bytes};

pub type Result<T> = std::result::Result<T, TrzszError>;

#[derive(Error, Debug)]
pub enum TrzszError {
    /// Peer asked us to terminate cleanly; the payload is a human message.
    #[error("{0}")]
    RemoteExit(String),

    /// Peer-side fatal (`fail` or `FAIL`); the message is final as-is.
    #[error("{0}")]
    RemoteFail(String),

    /// The transfer was stopped by the user or by EOF on stdin.
    #[error("Stopped")]
    Stopped,

    /// No data arrived within the per-chunk timeout.
    #[error("Receive data timeout")]
    Timeout,

    /// Local fatal without a stack, sent to the peer as `fail`.
    #[error("{0}")]
    Fail(String),

    /// Local fatal with a stack, sent to the peer as `FAIL`.
    #[error("{0}")]
    Fatal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrzszError {
    pub fn fail(message: impl Into<String>) -> TrzszError {
        TrzszError::Fail(message.into())
    }

    /// A fatal error with the backtrace of the construction site appended,
    /// so the peer's console shows where the protocol went off the rails.
    pub fn traced(message: impl Into<String>) -> TrzszError {
        TrzszError::Fatal(format!(
            "{}\n{}",
            message.into(),
            Backtrace::force_capture()
        ))
    }

    /// Classify a frame whose tag differs from the expected one.
    ///
    /// `EXIT` / `fail` / `FAIL` payloads are encoded messages from the
    /// peer; anything else is a local protocol violation.
    pub fn mismatch(tag: &str, payload: &str) -> TrzszError {
        match tag {
            "EXIT" => TrzszError::RemoteExit(decode_message(payload)),
            "fail" | "FAIL" => TrzszError::RemoteFail(decode_message(payload)),
            _ => TrzszError::traced(format!("[TrzszError] {}: {}", tag, payload)),
        }
    }

    /// An unparseable protocol line; the raw bytes ride along encoded.
    pub fn malformed_line(line: &[u8]) -> TrzszError {
        TrzszError::traced(format!("[TrzszError] colon: {}", encode_bytes(line)))
    }

    pub fn is_remote_exit(&self) -> bool {
        matches!(self, TrzszError::RemoteExit(_))
    }

    pub fn is_remote_fail(&self) -> bool {
        matches!(self, TrzszError::RemoteFail(_))
    }

    /// Whether the error should travel to the peer as `FAIL` (with stack)
    /// rather than `fail`.
    pub fn traceback(&self) -> bool {
        matches!(
            self,
            TrzszError::Fatal(_) | TrzszError::Io(_) | TrzszError::Json(_)
        )
    }
}

fn decode_message(payload: &str) -> String {
    match decode_string(payload) {
        Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
        Err(err) => format!("decode [{}] error: {}", payload, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_tags_decode_their_payload() {
        let payload = encode_bytes(b"bye now");
        let err = TrzszError::mismatch("EXIT", &payload);
        assert!(err.is_remote_exit());
        assert_eq!(err.to_string(), "bye now");

        let payload = encode_bytes("多字节消息".as_bytes());
        let err = TrzszError::mismatch("fail", &payload);
        assert!(err.is_remote_fail());
        assert_eq!(err.to_string(), "多字节消息");
    }

    #[test]
    fn unknown_tag_becomes_traced_local_error() {
        let err = TrzszError::mismatch("WHAT", "junk");
        assert!(!err.is_remote_exit());
        assert!(!err.is_remote_fail());
        assert!(err.traceback());
        assert!(err.to_string().starts_with("[TrzszError] WHAT: junk"));
    }

    #[test]
    fn bad_encoding_is_reported_not_propagated() {
        let err = TrzszError::mismatch("fail", "not-base64!");
        assert!(err.to_string().starts_with("decode [not-base64!] error:"));
    }

    #[test]
    fn sentinels_are_untraced() {
        assert!(!TrzszError::Stopped.traceback());
        assert!(!TrzszError::Timeout.traceback());
        assert!(!TrzszError::fail("nope").traceback());
        assert!(TrzszError::traced("boom").traceback());
    }
}
