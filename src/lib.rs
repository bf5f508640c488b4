//! trzsz transfer engine
//!
//! An lrzsz-style file transfer that runs inline over the interactive
//! terminal session itself: protocol frames share the PTY with normal
//! shell I/O and survive tmux rewrapping. The `trz`/`tsz` binaries are
//! the remote ends; a local client integrates through
//! [`protocol::parse_transfer_marker`] and the [`transfer`] engine.

pub mod buffer;
pub mod cli;
pub mod codec;
pub mod error;
pub mod escape;
pub mod fs_enum;
pub mod progress;
pub mod protocol;
pub mod pump;
pub mod tmux;
pub mod trace_log;
pub mod transfer;

pub use error::{Result, TrzszError};
pub use transfer::TrzszTransfer;
