//! Inline buffer between the stdin pump and the transfer state machine.
//!
//! Raw PTY bytes arrive in arbitrary chunks, interleaved with shell
//! echo, tmux redraws and VT100 cursor noise. The reader side pulls one
//! protocol line (or an exact binary run) at a time, blocking with a
//! timeout, and can be woken early by `stop_buffer`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, TrzszError};

pub struct TrzszBuffer {
    inner: Mutex<Inner>,
    cond: Condvar,
    stopped: AtomicBool,
}

struct Inner {
    // producer side: chunks as pushed by the pump
    chunks: VecDeque<Vec<u8>>,
    // consumer side: assembly buffer with a consumed-prefix cursor
    buf: Vec<u8>,
    cursor: usize,
    newline: Vec<u8>,
}

impl Default for TrzszBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TrzszBuffer {
    pub fn new() -> TrzszBuffer {
        TrzszBuffer {
            inner: Mutex::new(Inner {
                chunks: VecDeque::new(),
                buf: Vec::new(),
                cursor: 0,
                newline: b"\n".to_vec(),
            }),
            cond: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Switch the line terminator (`"\n"` or `"!\n"`) after negotiation.
    pub fn set_newline(&self, newline: &str) {
        self.inner.lock().newline = newline.as_bytes().to_vec();
    }

    /// Append an incoming chunk. Non-blocking; no-op once stopped.
    pub fn add_buffer(&self, data: &[u8]) {
        if self.stopped.load(Ordering::Acquire) || data.is_empty() {
            return;
        }
        self.inner.lock().chunks.push_back(data.to_vec());
        self.cond.notify_one();
    }

    /// Unblock the reader permanently; all further reads fail `Stopped`.
    /// Idempotent.
    pub fn stop_buffer(&self) {
        self.stopped.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Discard everything received so far.
    pub fn drain_buffer(&self) {
        let mut inner = self.inner.lock();
        inner.chunks.clear();
        inner.buf.clear();
        inner.cursor = 0;
    }

    /// Read the next line terminated by the configured newline, without
    /// the terminator. With `allow_junk`, VT100 escapes are stripped and
    /// lines carrying no frame marker are skipped.
    pub fn read_line(&self, allow_junk: bool, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if self.is_stopped() {
                return Err(TrzszError::Stopped);
            }
            inner.ingest();
            while let Some(line) = inner.next_line() {
                if !allow_junk {
                    return Ok(line);
                }
                let line = trim_vt100(&line);
                if line.contains(&b'#') {
                    return Ok(line);
                }
                // junk line, keep scanning
            }
            self.wait(&mut inner, deadline)?;
        }
    }

    /// Windows consoles may inject bare `\n` bytes, so the frame always
    /// ends at one regardless of the `!\n` convention; `\r` and VT100
    /// noise are stripped and markerless lines skipped.
    pub fn read_line_on_windows(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if self.is_stopped() {
                return Err(TrzszError::Stopped);
            }
            inner.ingest();
            while let Some(line) = inner.next_line_at(b"\n") {
                let mut line = trim_vt100(&line);
                line.retain(|&b| b != b'\r' && b != b'!');
                if line.contains(&b'#') && line.contains(&b':') {
                    return Ok(line);
                }
            }
            self.wait(&mut inner, deadline)?;
        }
    }

    /// Read exactly `n` raw bytes (binary-mode DATA payloads).
    pub fn read_binary(&self, n: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if self.is_stopped() {
                return Err(TrzszError::Stopped);
            }
            inner.ingest();
            if inner.available() >= n {
                return Ok(inner.take(n));
            }
            self.wait(&mut inner, deadline)?;
        }
    }

    fn wait(
        &self,
        inner: &mut parking_lot::MutexGuard<'_, Inner>,
        deadline: Option<Instant>,
    ) -> Result<()> {
        match deadline {
            Some(deadline) => {
                if self.cond.wait_until(inner, deadline).timed_out() {
                    return Err(TrzszError::Timeout);
                }
            }
            None => self.cond.wait(inner),
        }
        Ok(())
    }
}

impl Inner {
    fn ingest(&mut self) {
        while let Some(chunk) = self.chunks.pop_front() {
            if self.cursor > 0 && self.cursor == self.buf.len() {
                self.buf.clear();
                self.cursor = 0;
            }
            self.buf.extend_from_slice(&chunk);
        }
    }

    fn available(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        let newline = std::mem::take(&mut self.newline);
        let line = self.next_line_at(&newline);
        self.newline = newline;
        line
    }

    fn next_line_at(&mut self, pattern: &[u8]) -> Option<Vec<u8>> {
        let pending = &self.buf[self.cursor..];
        let idx = find(pending, pattern)?;
        let line = pending[..idx].to_vec();
        self.cursor += idx + pattern.len();
        Some(line)
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        let data = self.buf[self.cursor..self.cursor + n].to_vec();
        self.cursor += n;
        data
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Drop VT100 escape sequences: from ESC up to and including the next
/// ASCII letter.
pub fn trim_vt100(buf: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len());
    let mut in_escape = false;
    for &b in buf {
        if in_escape {
            if b.is_ascii_alphabetic() {
                in_escape = false;
            }
        } else if b == 0x1b {
            in_escape = true;
        } else {
            out.push(b);
        }
    }
    out
}
