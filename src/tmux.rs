//! tmux detection and output-tty discovery.
//!
//! Under tmux in normal mode the pane rewraps output at its width, so
//! protocol bytes go straight to the client tty instead. Control mode
//! has no tty to borrow; the transfer then runs through the pane and
//! the reader gets junk filtering turned on.

use std::fs::OpenOptions;
use std::io::{stdout, Write};
use std::path::Path;
use std::process::Command;

use crate::error::{Result, TrzszError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TmuxMode {
    NoTmux,
    TmuxNormalMode,
    TmuxControlMode,
}

/// Probe tmux. Returns the mode, the writer protocol bytes should use,
/// and the pane width (-1 when unknown).
pub fn check_tmux() -> Result<(TmuxMode, Box<dyn Write + Send>, i32)> {
    if std::env::var_os("TMUX").is_none() {
        return Ok((TmuxMode::NoTmux, Box::new(stdout()), -1));
    }

    let out = Command::new("tmux")
        .args([
            "display-message",
            "-p",
            "#{client_tty}:#{client_control_mode}:#{pane_width}",
        ])
        .output()
        .map_err(|e| TrzszError::fail(format!("run tmux error: {}", e)))?;
    let output = String::from_utf8_lossy(&out.stdout).trim().to_string();
    let (tty, control_mode, pane_width) = parse_tmux_output(&output)
        .ok_or_else(|| TrzszError::fail(format!("tmux unexpect output: {}", output)))?;

    if control_mode == "1" || !tty.starts_with('/') || !Path::new(&tty).exists() {
        return Ok((TmuxMode::TmuxControlMode, Box::new(stdout()), -1));
    }

    let tmux_stdout = OpenOptions::new().write(true).open(&tty)?;
    let width = if pane_width.is_empty() {
        -1
    } else {
        pane_width
            .parse::<i32>()
            .map_err(|e| TrzszError::fail(format!("parse pane width error: {}", e)))?
    };
    Ok((TmuxMode::TmuxNormalMode, Box::new(tmux_stdout), width))
}

fn parse_tmux_output(output: &str) -> Option<(String, String, String)> {
    let tokens: Vec<&str> = output.split(':').collect();
    if tokens.len() != 3 {
        return None;
    }
    Some((
        tokens[0].to_string(),
        tokens[1].to_string(),
        tokens[2].to_string(),
    ))
}

/// Column count of the controlling terminal, via `stty size`; 0 when
/// unavailable.
pub fn get_terminal_columns() -> i32 {
    let out = match Command::new("stty").arg("size").output() {
        Ok(out) => out,
        Err(_) => return 0,
    };
    parse_stty_size(String::from_utf8_lossy(&out.stdout).trim())
}

fn parse_stty_size(output: &str) -> i32 {
    let tokens: Vec<&str> = output.split(' ').collect();
    if tokens.len() != 2 {
        return 0;
    }
    tokens[1].parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmux_output_splits_into_three() {
        assert_eq!(
            parse_tmux_output("/dev/pts/3:0:211"),
            Some(("/dev/pts/3".into(), "0".into(), "211".into()))
        );
        assert!(parse_tmux_output("garbage").is_none());
        assert!(parse_tmux_output("a:b:c:d").is_none());
    }

    #[test]
    fn stty_size_yields_columns() {
        assert_eq!(parse_stty_size("50 211"), 211);
        assert_eq!(parse_stty_size(""), 0);
        assert_eq!(parse_stty_size("garbage here and more"), 0);
    }
}
