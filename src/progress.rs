//! Progress reporting.
//!
//! The transfer engine only talks to the [`ProgressCallback`] trait; any
//! renderer can plug in. The bundled renderer drives a single indicatif
//! bar per file with throughput and ETA.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Callbacks emitted by the transfer state machine. All methods default
/// to no-ops so a renderer implements only what it shows.
pub trait ProgressCallback: Send {
    /// Number of entries in the batch.
    fn on_num(&self, _num: i64) {}
    /// A new file or directory entry started.
    fn on_name(&self, _name: &str) {}
    /// Size of the file that is about to stream.
    fn on_size(&self, _size: i64) {}
    /// Bytes of the current file transferred so far.
    fn on_step(&self, _step: i64) {}
    /// Current file finished (MD5 verified).
    fn on_done(&self) {}
}

/// Terminal renderer: one bar reused across the batch.
pub struct TransferProgress {
    bar: ProgressBar,
    columns: AtomicUsize,
    done: AtomicUsize,
    num: AtomicUsize,
}

impl TransferProgress {
    pub fn new(columns: usize) -> TransferProgress {
        let bar = ProgressBar::hidden();
        bar.set_style(bar_style());
        bar.enable_steady_tick(Duration::from_millis(200));
        TransferProgress {
            bar,
            columns: AtomicUsize::new(columns),
            done: AtomicUsize::new(0),
            num: AtomicUsize::new(0),
        }
    }

    /// Forwarded from the PTY resize callback.
    pub fn set_terminal_columns(&self, columns: usize) {
        self.columns.store(columns, Ordering::Relaxed);
    }

    fn prefix(&self, name: &str) -> String {
        // keep the bar on one row even in narrow tmux panes
        let columns = self.columns.load(Ordering::Relaxed);
        let max_width = if columns > 60 { columns - 50 } else { 10 };
        if name.chars().count() > max_width {
            let cut: String = name.chars().take(max_width.saturating_sub(3)).collect();
            format!("{}...", cut)
        } else {
            name.to_string()
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix} [{bar:25}] {bytes}/{total_bytes} {bytes_per_sec} {eta}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

impl ProgressCallback for TransferProgress {
    fn on_num(&self, num: i64) {
        self.num.store(num.max(0) as usize, Ordering::Relaxed);
    }

    fn on_name(&self, name: &str) {
        let done = self.done.load(Ordering::Relaxed);
        let num = self.num.load(Ordering::Relaxed);
        self.bar.set_prefix(format!(
            "({}/{}) {}",
            (done + 1).min(num.max(1)),
            num,
            self.prefix(name)
        ));
        self.bar.set_position(0);
        self.bar
            .set_draw_target(indicatif::ProgressDrawTarget::stderr());
    }

    fn on_size(&self, size: i64) {
        self.bar.set_length(size.max(0) as u64);
    }

    fn on_step(&self, step: i64) {
        self.bar.set_position(step.max(0) as u64);
    }

    fn on_done(&self) {
        self.done.fetch_add(1, Ordering::Relaxed);
        self.bar.set_position(self.bar.length().unwrap_or(0));
    }
}

impl Drop for TransferProgress {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
    }
}
