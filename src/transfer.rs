//! The transfer state machine.
//!
//! One `TrzszTransfer` drives either role of a conversation: the
//! handshake (ACT/CFG), then per file NAME/SIZE/DATA/MD5 with an
//! acknowledged echo after every frame, and the error exchange when
//! anything goes wrong. All methods take `&self`; the pieces shared
//! with the stdin pump and the signal handler are atomics or locks, so
//! one `Arc<TrzszTransfer>` serves all three tasks.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use crate::buffer::TrzszBuffer;
use crate::cli::TransferArgs;
use crate::codec::{decode_string, encode_bytes, encode_string};
use crate::error::{Result, TrzszError};
use crate::escape::{escape_data, unescape_data, EscapeTable};
use crate::fs_enum::{do_create_directory, do_create_file, get_new_name, FileRecord};
use crate::progress::ProgressCallback;
use crate::protocol::{TransferAction, TransferConfig, PROTOCOL_VERSION};
use crate::tmux::TmuxMode;
use crate::trace_log::TraceLog;

const INITIAL_BUF_SIZE: i64 = 1024;
// a full chunk faster than this doubles the chunk size
const SPEED_UP_CHUNK_TIME: Duration = Duration::from_millis(500);
// a chunk slower than this resets the chunk size
const SLOW_DOWN_CHUNK_TIME: Duration = Duration::from_secs(2);

pub struct TrzszTransfer {
    buffer: TrzszBuffer,
    writer: Mutex<Box<dyn Write + Send>>,
    stopped: AtomicBool,
    last_input_time: AtomicI64,
    clean_timeout: Mutex<Duration>,
    max_chunk_time: Mutex<Duration>,
    file_name_map: Mutex<HashMap<i64, String>>,
    remote_is_windows: AtomicBool,
    restore_stdin: bool,
    config: RwLock<TransferConfig>,
    trace: Option<TraceLog>,
}

impl TrzszTransfer {
    /// `restore_stdin` says raw mode was enabled and must be undone on
    /// the way out.
    pub fn new(writer: Box<dyn Write + Send>, restore_stdin: bool) -> TrzszTransfer {
        TrzszTransfer {
            buffer: TrzszBuffer::new(),
            writer: Mutex::new(writer),
            stopped: AtomicBool::new(false),
            last_input_time: AtomicI64::new(0),
            clean_timeout: Mutex::new(Duration::from_millis(100)),
            max_chunk_time: Mutex::new(Duration::ZERO),
            file_name_map: Mutex::new(HashMap::new()),
            remote_is_windows: AtomicBool::new(false),
            restore_stdin,
            config: RwLock::new(TransferConfig::default()),
            trace: TraceLog::from_env(),
        }
    }

    pub fn config(&self) -> TransferConfig {
        self.config.read().clone()
    }

    /// Called by the stdin pump for every chunk off the PTY.
    pub fn add_received_data(&self, data: &[u8]) {
        if let Some(trace) = &self.trace {
            trace.trace("recv", data);
        }
        if !self.stopped.load(Ordering::Acquire) {
            self.buffer.add_buffer(data);
        }
        self.last_input_time.store(now_millis(), Ordering::Release);
    }

    /// User cancel (signal or stdin EOF): wake the reader with `Stopped`
    /// and widen the quiescence window for the error exchange.
    pub fn stop_transferring_files(&self) {
        let max_chunk = *self.max_chunk_time.lock();
        *self.clean_timeout.lock() = std::cmp::max(max_chunk * 2, Duration::from_millis(500));
        self.stopped.store(true, Ordering::Release);
        self.buffer.stop_buffer();
    }

    /// Stop accepting input, then wait until the stream has been silent
    /// for `timeout`, so a peer's in-flight frames cannot land in the
    /// shell after we hand the terminal back.
    pub fn clean_input(&self, timeout: Duration) {
        self.stopped.store(true, Ordering::Release);
        self.buffer.drain_buffer();
        self.last_input_time.store(now_millis(), Ordering::Release);
        loop {
            let last = self.last_input_time.load(Ordering::Acquire);
            let quiet = now_millis().saturating_sub(last).max(0) as u64;
            let quiet = Duration::from_millis(quiet);
            if quiet >= timeout {
                return;
            }
            std::thread::sleep(timeout - quiet);
        }
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        if let Some(trace) = &self.trace {
            trace.trace("send", data);
        }
        let mut writer = self.writer.lock();
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn send_line(&self, typ: &str, buf: &str) -> Result<()> {
        let newline = self.config.read().newline.clone();
        self.write_all(format!("#{}:{}{}", typ, buf, newline).as_bytes())
    }

    fn windows_line_mode(&self) -> bool {
        cfg!(windows) || self.remote_is_windows.load(Ordering::Acquire)
    }

    fn recv_line(
        &self,
        expect_type: &str,
        may_has_junk: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TrzszError::Stopped);
        }

        if self.windows_line_mode() {
            let line = self.buffer.read_line_on_windows(timeout)?;
            return Ok(truncate_before_marker(line, expect_type));
        }

        let junk = self.config.read().tmux_output_junk || may_has_junk;
        let line = self.buffer.read_line(junk, timeout)?;
        if junk {
            return Ok(truncate_before_marker(line, expect_type));
        }
        Ok(line)
    }

    fn recv_check(
        &self,
        expect_type: &str,
        may_has_junk: bool,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let line = self.recv_line(expect_type, may_has_junk, timeout)?;
        let idx = match line.iter().position(|&b| b == b':') {
            Some(idx) if idx >= 1 => idx,
            _ => return Err(TrzszError::malformed_line(&line)),
        };
        let typ = String::from_utf8_lossy(&line[1..idx]).into_owned();
        let buf = String::from_utf8_lossy(&line[idx + 1..]).into_owned();
        if typ != expect_type {
            return Err(TrzszError::mismatch(&typ, &buf));
        }
        Ok(buf)
    }

    fn send_integer(&self, typ: &str, val: i64) -> Result<()> {
        self.send_line(typ, &val.to_string())
    }

    fn recv_integer(
        &self,
        typ: &str,
        may_has_junk: bool,
        timeout: Option<Duration>,
    ) -> Result<i64> {
        let buf = self.recv_check(typ, may_has_junk, timeout)?;
        buf.parse()
            .map_err(|_| TrzszError::traced(format!("Parse integer [{}] error", buf)))
    }

    fn check_integer(&self, expect: i64) -> Result<()> {
        let result = self.recv_integer("SUCC", false, None)?;
        if result != expect {
            return Err(TrzszError::traced(format!(
                "Integer check [{}] <> [{}]",
                result, expect
            )));
        }
        Ok(())
    }

    fn send_string(&self, typ: &str, s: &str) -> Result<()> {
        self.send_line(typ, &encode_string(s))
    }

    fn recv_string(&self, typ: &str, may_has_junk: bool) -> Result<String> {
        let buf = self.recv_check(typ, may_has_junk, None)?;
        Ok(String::from_utf8_lossy(&decode_string(&buf)?).into_owned())
    }

    fn send_binary_frame(&self, typ: &str, buf: &[u8]) -> Result<()> {
        self.send_line(typ, &encode_bytes(buf))
    }

    fn recv_binary_frame(
        &self,
        typ: &str,
        may_has_junk: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let buf = self.recv_check(typ, may_has_junk, timeout)?;
        decode_string(&buf)
    }

    fn check_binary(&self, expect: &[u8]) -> Result<()> {
        let result = self.recv_binary_frame("SUCC", false, None)?;
        if result != expect {
            return Err(TrzszError::traced(format!(
                "Binary check [{:?}] <> [{:?}]",
                result, expect
            )));
        }
        Ok(())
    }

    fn send_data(&self, data: &[u8]) -> Result<()> {
        if !self.config.read().binary {
            return self.send_binary_frame("DATA", data);
        }
        let escaped = escape_data(data, &self.config.read().escape_codes);
        self.write_all(format!("#DATA:{}\n", escaped.len()).as_bytes())?;
        self.write_all(&escaped)
    }

    fn get_new_timeout(&self) -> Option<Duration> {
        let timeout = self.config.read().timeout;
        (timeout > 0).then(|| Duration::from_secs(timeout as u64))
    }

    fn recv_data(&self) -> Result<Vec<u8>> {
        let timeout = self.get_new_timeout();
        if !self.config.read().binary {
            return self.recv_binary_frame("DATA", false, timeout);
        }
        let size = self.recv_integer("DATA", false, timeout)?;
        let data = self.buffer.read_binary(size as usize, timeout)?;
        unescape_data(&data, &self.config.read().escape_codes)
    }

    // ---- handshake ----

    /// Client side: declare capabilities and whether the user confirmed.
    pub fn send_action(&self, confirm: bool, remote_is_windows: bool) -> Result<()> {
        let action = TransferAction::new(confirm, remote_is_windows);
        let action_str = serde_json::to_string(&action)?;
        if remote_is_windows {
            self.remote_is_windows.store(true, Ordering::Release);
            self.config.write().newline = "!\n".to_string();
            self.buffer.set_newline("!\n");
        }
        self.send_string("ACT", &action_str)
    }

    /// Server side: learn the peer's capabilities and adopt its newline.
    pub fn recv_action(&self) -> Result<TransferAction> {
        let action_str = self.recv_string("ACT", false)?;
        let action: TransferAction = serde_json::from_str(&action_str)?;
        self.config.write().newline = action.newline.clone();
        self.buffer.set_newline(&action.newline);
        if action.newline == "!\n" {
            self.remote_is_windows.store(true, Ordering::Release);
        }
        Ok(action)
    }

    /// Server side: build the CFG from the CLI flags and the peer's
    /// capabilities, re-parse the serialized form into our own config so
    /// both sides hold the identical value, then transmit it.
    pub fn send_config(
        &self,
        args: &TransferArgs,
        action: &TransferAction,
        escape_codes: EscapeTable,
        tmux_mode: TmuxMode,
        tmux_pane_width: i32,
    ) -> Result<()> {
        let mut cfg = TransferConfig {
            lang: "rust".to_string(),
            newline: self.config.read().newline.clone(),
            ..TransferConfig::default()
        };
        cfg.quiet = args.quiet;
        if args.binary {
            cfg.binary = true;
            cfg.escape_codes = escape_codes;
        }
        cfg.directory = args.directory;
        cfg.overwrite = args.overwrite;
        cfg.max_buf_size = args.bufsize;
        cfg.timeout = args.timeout;
        if tmux_mode == TmuxMode::TmuxNormalMode {
            cfg.tmux_output_junk = true;
            cfg.tmux_pane_columns = tmux_pane_width;
        }
        cfg.protocol = action.protocol.min(PROTOCOL_VERSION);

        let cfg_str = serde_json::to_string(&cfg)?;
        *self.config.write() = serde_json::from_str(&cfg_str)?;
        self.buffer.set_newline(&self.config.read().newline);
        self.send_string("CFG", &cfg_str)
    }

    /// Client side. Junk-tolerant: the peer's tmux flag is not known
    /// until this very frame arrives.
    pub fn recv_config(&self) -> Result<TransferConfig> {
        let cfg_str = self.recv_string("CFG", true)?;
        let mut cfg: TransferConfig = serde_json::from_str(&cfg_str)?;
        // older peers omit the newline field from the CFG; keep what the
        // ACT exchange negotiated instead of resetting to the default
        if !cfg_str.contains("\"newline\"") {
            cfg.newline = self.config.read().newline.clone();
        }
        self.buffer.set_newline(&cfg.newline);
        *self.config.write() = cfg.clone();
        Ok(cfg)
    }

    pub fn client_exit(&self, msg: &str) -> Result<()> {
        self.send_string("EXIT", msg)
    }

    pub fn recv_exit(&self) -> Result<String> {
        self.recv_string("EXIT", false)
    }

    /// Hand the terminal back and print the framed farewell.
    pub fn server_exit(&self, msg: &str) {
        self.clean_input(Duration::from_millis(500));
        if self.restore_stdin {
            let _ = crossterm::terminal::disable_raw_mode();
        }
        let mut out = std::io::stdout();
        if cfg!(windows) {
            let msg = msg.replace('\n', "\r\n");
            let _ = out.write_all(b"\x1b[H\x1b[2J\x1b[?1049l");
            let _ = out.write_all(msg.as_bytes());
        } else {
            let _ = out.write_all(b"\x1b8\x1b[0J");
            let _ = out.write_all(msg.as_bytes());
        }
        let _ = out.write_all(b"\r\n");
        let _ = out.flush();
    }

    /// Report a failure to the peer unless the peer reported it first.
    pub fn client_error(&self, err: &TrzszError) {
        self.clean_input(*self.clean_timeout.lock());
        if err.is_remote_exit() || err.is_remote_fail() {
            return;
        }
        let typ = if err.traceback() { "FAIL" } else { "fail" };
        let _ = self.send_string(typ, &err.to_string());
    }

    pub fn server_error(&self, err: &TrzszError) {
        self.clean_input(*self.clean_timeout.lock());
        if err.is_remote_exit() || err.is_remote_fail() {
            self.server_exit(&err.to_string());
            return;
        }
        let typ = if err.traceback() { "FAIL" } else { "fail" };
        let _ = self.send_string(typ, &err.to_string());
        self.server_exit(&err.to_string());
    }

    // ---- sender role ----

    fn send_file_num(&self, num: i64, progress: Option<&dyn ProgressCallback>) -> Result<()> {
        self.send_integer("NUM", num)?;
        self.check_integer(num)?;
        if let Some(progress) = progress {
            progress.on_num(num);
        }
        Ok(())
    }

    fn send_file_name(
        &self,
        record: &FileRecord,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<(Option<File>, String)> {
        let file_name = if self.config.read().directory {
            serde_json::to_string(record)?
        } else {
            record.rel_path[0].clone()
        };
        self.send_string("NAME", &file_name)?;
        let remote_name = self.recv_string("SUCC", false)?;
        if let Some(progress) = progress {
            progress.on_name(record.file_name());
        }
        if record.is_dir {
            return Ok((None, remote_name));
        }
        let file = File::open(&record.abs_path)?;
        Ok((Some(file), remote_name))
    }

    fn send_file_size(
        &self,
        file: &File,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<i64> {
        let size = file.metadata()?.len() as i64;
        self.send_integer("SIZE", size)?;
        self.check_integer(size)?;
        if let Some(progress) = progress {
            progress.on_size(size);
        }
        Ok(size)
    }

    fn send_file_data(
        &self,
        file: &mut File,
        size: i64,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<Vec<u8>> {
        let mut step = 0i64;
        if let Some(progress) = progress {
            progress.on_step(step);
        }
        let mut buf_size = INITIAL_BUF_SIZE;
        let mut buffer = vec![0u8; buf_size as usize];
        let mut hasher = md5::Context::new();
        while step < size {
            let begin = Instant::now();
            let n = file.read(&mut buffer)?;
            if n == 0 {
                return Err(TrzszError::traced(format!(
                    "Read file unexpected EOF at {}",
                    step
                )));
            }
            let data = &buffer[..n];
            self.send_data(data)?;
            hasher.consume(data);
            self.check_integer(n as i64)?;
            step += n as i64;
            if let Some(progress) = progress {
                progress.on_step(step);
            }
            let chunk_time = begin.elapsed();
            let next = next_buf_size(
                buf_size,
                n as i64,
                chunk_time,
                self.config.read().max_buf_size,
            );
            if next != buf_size {
                buf_size = next;
                buffer = vec![0u8; buf_size as usize];
            }
            self.note_chunk_time(chunk_time);
        }
        Ok(hasher.compute().0.to_vec())
    }

    fn send_file_md5(&self, digest: &[u8], progress: Option<&dyn ProgressCallback>) -> Result<()> {
        self.send_binary_frame("MD5", digest)?;
        self.check_binary(digest)?;
        if let Some(progress) = progress {
            progress.on_done();
        }
        Ok(())
    }

    /// Send a walked batch; returns the names the receiver stored them
    /// under.
    pub fn send_files(
        &self,
        files: &[FileRecord],
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<Vec<String>> {
        self.send_file_num(files.len() as i64, progress)?;

        let mut remote_names: Vec<String> = Vec::new();
        for record in files {
            let (file, remote_name) = self.send_file_name(record, progress)?;
            if !remote_names.contains(&remote_name) {
                remote_names.push(remote_name);
            }
            let mut file = match file {
                Some(file) => file,
                None => continue,
            };
            let size = self.send_file_size(&file, progress)?;
            let digest = self.dispatch_send_file_data(&mut file, size, progress)?;
            self.send_file_md5(&digest, progress)?;
        }
        Ok(remote_names)
    }

    // Protocol 2 keeps the same per-file framing but chunks differently;
    // its semantics are not specified here, so anything above v1 is
    // refused at the dispatch seam.
    fn dispatch_send_file_data(
        &self,
        file: &mut File,
        size: i64,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<Vec<u8>> {
        match self.config.read().protocol {
            0 | 1 => self.send_file_data(file, size, progress),
            version => Err(TrzszError::fail(format!(
                "unsupported transfer protocol: {}",
                version
            ))),
        }
    }

    fn dispatch_recv_file_data(
        &self,
        file: &mut File,
        size: i64,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<Vec<u8>> {
        match self.config.read().protocol {
            0 | 1 => self.recv_file_data(file, size, progress),
            version => Err(TrzszError::fail(format!(
                "unsupported transfer protocol: {}",
                version
            ))),
        }
    }

    // ---- receiver role ----

    fn recv_file_num(&self, progress: Option<&dyn ProgressCallback>) -> Result<i64> {
        let num = self.recv_integer("NUM", false, None)?;
        self.send_integer("SUCC", num)?;
        if let Some(progress) = progress {
            progress.on_num(num);
        }
        Ok(num)
    }

    fn create_file(&self, path: &Path, file_name: &str) -> Result<(File, String)> {
        let local_name = if self.config.read().overwrite {
            file_name.to_string()
        } else {
            get_new_name(path, file_name)?
        };
        let file = do_create_file(&path.join(&local_name))?;
        Ok((file, local_name))
    }

    fn create_dir_or_file(
        &self,
        path: &Path,
        name: &str,
    ) -> Result<(Option<File>, String, String)> {
        let record: FileRecord = serde_json::from_str(name)?;
        if record.rel_path.is_empty() {
            return Err(TrzszError::fail(format!("Invalid name: {}", name)));
        }

        let file_name = record.rel_path.last().cloned().unwrap_or_default();

        // the first record of each path_id decides the local root name;
        // every later record of the tree reuses it
        let local_name = if self.config.read().overwrite {
            record.rel_path[0].clone()
        } else {
            let mut map = self.file_name_map.lock();
            match map.get(&record.path_id) {
                Some(name) => name.clone(),
                None => {
                    let name = get_new_name(path, &record.rel_path[0])?;
                    map.insert(record.path_id, name.clone());
                    name
                }
            }
        };

        let full_path: PathBuf = if record.rel_path.len() > 1 {
            let mut parent = path.join(&local_name);
            for seg in &record.rel_path[1..record.rel_path.len() - 1] {
                parent = parent.join(seg);
            }
            do_create_directory(&parent)?;
            parent.join(&file_name)
        } else {
            path.join(&local_name)
        };

        if record.is_dir {
            do_create_directory(&full_path)?;
            return Ok((None, local_name, file_name));
        }
        let file = do_create_file(&full_path)?;
        Ok((Some(file), local_name, file_name))
    }

    fn recv_file_name(
        &self,
        path: &Path,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<(Option<File>, String)> {
        let incoming = self.recv_string("NAME", false)?;

        let (file, local_name, file_name) = if self.config.read().directory {
            self.create_dir_or_file(path, &incoming)?
        } else {
            let (file, local_name) = self.create_file(path, &incoming)?;
            (Some(file), local_name, incoming)
        };

        self.send_string("SUCC", &local_name)?;
        if let Some(progress) = progress {
            progress.on_name(&file_name);
        }
        Ok((file, local_name))
    }

    fn recv_file_size(&self, progress: Option<&dyn ProgressCallback>) -> Result<i64> {
        let size = self.recv_integer("SIZE", false, None)?;
        self.send_integer("SUCC", size)?;
        if let Some(progress) = progress {
            progress.on_size(size);
        }
        Ok(size)
    }

    fn recv_file_data(
        &self,
        file: &mut File,
        size: i64,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<Vec<u8>> {
        let mut step = 0i64;
        if let Some(progress) = progress {
            progress.on_step(step);
        }
        let mut hasher = md5::Context::new();
        while step < size {
            let begin = Instant::now();
            let data = self.recv_data()?;
            file.write_all(&data)?;
            step += data.len() as i64;
            if let Some(progress) = progress {
                progress.on_step(step);
            }
            self.send_integer("SUCC", data.len() as i64)?;
            hasher.consume(&data);
            self.note_chunk_time(begin.elapsed());
        }
        Ok(hasher.compute().0.to_vec())
    }

    fn recv_file_md5(&self, digest: &[u8], progress: Option<&dyn ProgressCallback>) -> Result<()> {
        let expect_digest = self.recv_binary_frame("MD5", false, None)?;
        if digest != expect_digest {
            return Err(TrzszError::fail("Check MD5 failed"));
        }
        self.send_binary_frame("SUCC", digest)?;
        if let Some(progress) = progress {
            progress.on_done();
        }
        Ok(())
    }

    /// Receive a batch into `path`; returns the local names used.
    pub fn recv_files(
        &self,
        path: &Path,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<Vec<String>> {
        let num = self.recv_file_num(progress)?;

        let mut local_names: Vec<String> = Vec::new();
        for _ in 0..num {
            let (file, local_name) = self.recv_file_name(path, progress)?;
            if !local_names.contains(&local_name) {
                local_names.push(local_name);
            }
            let mut file = match file {
                Some(file) => file,
                None => continue,
            };
            let size = self.recv_file_size(progress)?;
            let digest = self.dispatch_recv_file_data(&mut file, size, progress)?;
            self.recv_file_md5(&digest, progress)?;
        }
        Ok(local_names)
    }

    fn note_chunk_time(&self, chunk_time: Duration) {
        let mut max_chunk = self.max_chunk_time.lock();
        if chunk_time > *max_chunk {
            *max_chunk = chunk_time;
        }
    }
}

/// Adaptive chunk sizing: grow while the pipe keeps up, fall back hard
/// when it stalls.
fn next_buf_size(current: i64, read_len: i64, elapsed: Duration, max_buf_size: i64) -> i64 {
    if read_len == current && elapsed < SPEED_UP_CHUNK_TIME && current < max_buf_size {
        (current * 2).min(max_buf_size)
    } else if elapsed >= SLOW_DOWN_CHUNK_TIME && current > INITIAL_BUF_SIZE {
        INITIAL_BUF_SIZE
    } else {
        current
    }
}

fn truncate_before_marker(line: Vec<u8>, expect_type: &str) -> Vec<u8> {
    let marker = format!("#{}:", expect_type).into_bytes();
    if let Some(idx) = rfind(&line, &marker) {
        line[idx..].to_vec()
    } else {
        line
    }
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .rposition(|w| w == needle)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_bytes;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl SharedWriter {
        fn take(&self) -> Vec<u8> {
            std::mem::take(&mut *self.0.lock())
        }
    }

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn new_transfer() -> (TrzszTransfer, SharedWriter) {
        let writer = SharedWriter::default();
        let transfer = TrzszTransfer::new(Box::new(writer.clone()), false);
        (transfer, writer)
    }

    #[test]
    fn chunk_size_reaches_the_cap_quickly() {
        let max = 10 * 1024 * 1024;
        let mut size = INITIAL_BUF_SIZE;
        let mut chunks = 0;
        while size < max {
            size = next_buf_size(size, size, Duration::from_millis(100), max);
            chunks += 1;
            assert!(size <= max);
            assert!(chunks <= 14, "took more than 14 chunks");
        }
        assert_eq!(size, max);
        // at the cap it stays put
        assert_eq!(next_buf_size(size, size, Duration::from_millis(100), max), max);
    }

    #[test]
    fn chunk_size_resets_on_stall() {
        let max = 10 * 1024 * 1024;
        assert_eq!(
            next_buf_size(64 * 1024, 64 * 1024, Duration::from_secs(3), max),
            INITIAL_BUF_SIZE
        );
        // short read means no growth
        assert_eq!(
            next_buf_size(2048, 100, Duration::from_millis(10), max),
            2048
        );
        // already at the floor: a stall changes nothing
        assert_eq!(
            next_buf_size(INITIAL_BUF_SIZE, INITIAL_BUF_SIZE, Duration::from_secs(3), max),
            INITIAL_BUF_SIZE
        );
    }

    #[test]
    fn send_line_uses_negotiated_newline() {
        let (transfer, writer) = new_transfer();
        transfer.send_line("NUM", "3").unwrap();
        assert_eq!(writer.take(), b"#NUM:3\n");

        transfer.config.write().newline = "!\n".to_string();
        transfer.send_line("NUM", "3").unwrap();
        assert_eq!(writer.take(), b"#NUM:3!\n");
    }

    #[test]
    fn recv_check_returns_expected_payload() {
        let (transfer, _writer) = new_transfer();
        transfer.add_received_data(b"#SIZE:42\n");
        assert_eq!(transfer.recv_check("SIZE", false, None).unwrap(), "42");
    }

    #[test]
    fn recv_check_classifies_mismatches() {
        let (transfer, _writer) = new_transfer();

        transfer.add_received_data(format!("#EXIT:{}\n", encode_bytes(b"done")).as_bytes());
        let err = transfer.recv_check("SUCC", false, None).unwrap_err();
        assert!(err.is_remote_exit());
        assert_eq!(err.to_string(), "done");

        transfer.add_received_data(format!("#fail:{}\n", encode_bytes(b"oops")).as_bytes());
        let err = transfer.recv_check("SUCC", false, None).unwrap_err();
        assert!(err.is_remote_fail());
        assert_eq!(err.to_string(), "oops");

        transfer.add_received_data(b"no colon here\n");
        let err = transfer.recv_check("SUCC", false, None).unwrap_err();
        assert!(err.traceback());
    }

    #[test]
    fn junk_reads_reduce_to_the_last_frame() {
        let (transfer, _writer) = new_transfer();
        transfer.config.write().tmux_output_junk = true;
        transfer.add_received_data(b"echoed #SUCC:1\x1b[0m then #SUCC:2\n");
        assert_eq!(transfer.recv_check("SUCC", false, None).unwrap(), "2");
    }

    #[test]
    fn binary_data_is_length_prefixed_and_escaped() {
        let (transfer, writer) = new_transfer();
        {
            let mut cfg = transfer.config.write();
            cfg.binary = true;
            cfg.escape_codes = crate::escape::escape_table(false);
        }
        transfer.send_data(b"a\x02b").unwrap();
        let sent = writer.take();
        // 0x02 grows into two bytes, so the length line says 4
        assert!(sent.starts_with(b"#DATA:4\n"));
        assert_eq!(&sent[8..], b"a\xee\x43b");
    }

    #[test]
    fn base64_data_round_trips_through_recv() {
        let (a, writer) = new_transfer();
        a.send_data(b"payload bytes").unwrap();

        let (b, _writer) = new_transfer();
        b.add_received_data(&writer.take());
        assert_eq!(b.recv_data().unwrap(), b"payload bytes");
    }

    #[test]
    fn stopped_transfer_refuses_reads() {
        let (transfer, _writer) = new_transfer();
        transfer.add_received_data(b"#SUCC:1\n");
        transfer.stop_transferring_files();
        assert!(matches!(
            transfer.recv_check("SUCC", false, None),
            Err(TrzszError::Stopped)
        ));
    }

    #[test]
    fn clean_input_waits_for_quiescence() {
        let (transfer, _writer) = new_transfer();
        let begin = Instant::now();
        transfer.clean_input(Duration::from_millis(50));
        let elapsed = begin.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn config_identical_after_send_round_trip() {
        let (server, writer) = new_transfer();
        let args = crate::cli::TransferArgs {
            quiet: false,
            overwrite: true,
            binary: true,
            escape: false,
            directory: false,
            bufsize: 2 * 1024 * 1024,
            timeout: 10,
        };
        let action = TransferAction::new(true, false);
        server
            .send_config(
                &args,
                &action,
                crate::escape::escape_table(false),
                TmuxMode::NoTmux,
                -1,
            )
            .unwrap();

        let (client, _writer) = new_transfer();
        client.add_received_data(&writer.take());
        let cfg = client.recv_config().unwrap();
        assert_eq!(cfg, server.config());
        assert!(cfg.binary && cfg.overwrite);
        assert_eq!(cfg.max_buf_size, 2 * 1024 * 1024);
        assert_eq!(cfg.protocol, 1);
    }

    #[test]
    fn action_flips_newline_for_windows_peers() {
        let (client, writer) = new_transfer();
        client.send_action(true, true).unwrap();
        let sent = writer.take();
        assert!(sent.ends_with(b"!\n"));

        // a "!\n" client only ever talks to a Windows server, which
        // reads bare-\n lines and drops the '!' terminator residue
        let (server, _writer) = new_transfer();
        server.remote_is_windows.store(true, Ordering::Release);
        server.add_received_data(&sent);
        let action = server.recv_action().unwrap();
        assert_eq!(action.newline, "!\n");
        assert!(!action.support_binary);
        assert_eq!(server.config().newline, "!\n");
    }
}
