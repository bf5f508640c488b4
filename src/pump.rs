//! Background tasks: the stdin pump and the signal handler.
//!
//! The state machine never touches stdin itself; one thread reads the
//! PTY stream and pushes chunks into the inline buffer. SIGINT/SIGTERM
//! and stdin EOF all funnel into `stop_transferring_files`, which wakes
//! the reader with a `Stopped` sentinel.

use std::io::Read;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::error::Result;
use crate::transfer::TrzszTransfer;

const STDIN_BUF_SIZE: usize = 32 * 1024;

/// Feed stdin into the transfer until EOF or error.
pub fn pump_stdin(transfer: Arc<TrzszTransfer>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut buffer = [0u8; STDIN_BUF_SIZE];
        loop {
            match stdin.read(&mut buffer) {
                Ok(0) | Err(_) => {
                    transfer.stop_transferring_files();
                    return;
                }
                Ok(n) => transfer.add_received_data(&buffer[..n]),
            }
        }
    })
}

/// Turn SIGINT/SIGTERM into a graceful stop.
pub fn handle_server_signal(transfer: Arc<TrzszTransfer>) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::spawn(move || {
        if signals.forever().next().is_some() {
            transfer.stop_transferring_files();
        }
    });
    Ok(())
}
