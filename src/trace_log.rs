//! Optional on-disk protocol trace.
//!
//! When `TRZSZ_TRACE_LOG` names a writable path, every byte run that
//! crosses the PTY is appended with a direction tag. Invaluable when a
//! transfer dies somewhere inside a tmux pane.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;

pub const TRACE_LOG_ENV: &str = "TRZSZ_TRACE_LOG";

pub struct TraceLog {
    file: Mutex<File>,
}

impl TraceLog {
    /// Only active when the environment asks for it.
    pub fn from_env() -> Option<TraceLog> {
        let path = std::env::var(TRACE_LOG_ENV).ok()?;
        if path.is_empty() {
            return None;
        }
        TraceLog::new(path).ok()
    }

    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<TraceLog> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(TraceLog {
            file: Mutex::new(file),
        })
    }

    /// `direction` is `"recv"` or `"send"` from this process's view.
    pub fn trace(&self, direction: &str, data: &[u8]) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(
                f,
                "[{}] {} {}",
                Utc::now().to_rfc3339(),
                direction,
                String::from_utf8_lossy(data).escape_debug()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn traces_are_appended_with_direction() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("trace.log");
        let log = TraceLog::new(&path).unwrap();
        log.trace("send", b"#NUM:1\n");
        log.trace("recv", b"#SUCC:1\n");

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("send #NUM:1"));
        assert!(lines[1].contains("recv #SUCC:1"));
    }
}
