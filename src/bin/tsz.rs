//! tsz - send file(s) from the remote shell side, similar to sz and
//! compatible with tmux.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use crossterm::terminal;

use trzsz::cli::TransferArgs;
use trzsz::escape::escape_table;
use trzsz::fs_enum::{check_paths_readable, FileRecord};
use trzsz::protocol::{self, TransferMode};
use trzsz::pump::{handle_server_signal, pump_stdin};
use trzsz::tmux::{check_tmux, get_terminal_columns, TmuxMode};
use trzsz::transfer::TrzszTransfer;
use trzsz::TrzszError;

#[derive(Debug, Parser)]
#[command(
    name = "tsz",
    version,
    about = "Send file(s), similar to sz and compatible with tmux."
)]
struct TszArgs {
    #[command(flatten)]
    transfer: TransferArgs,

    /// file(s) to be sent
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let mut args = TszArgs::parse();

    let records = match check_paths_readable(&args.files, args.transfer.directory) {
        Ok(records) => records,
        Err(err) => {
            eprintln!("{}", err);
            return -1;
        }
    };

    let (tmux_mode, real_stdout, tmux_pane_width) = match check_tmux() {
        Ok(probe) => probe,
        Err(err) => {
            eprintln!("{}", err);
            return -3;
        }
    };

    if args.transfer.binary && tmux_mode != TmuxMode::NoTmux {
        println!("Binary download in tmux is not supported, auto switch to base64 mode.");
        args.transfer.binary = false;
    }
    if args.transfer.binary && cfg!(windows) {
        println!("Binary download on Windows is not supported, auto switch to base64 mode.");
        args.transfer.binary = false;
    }

    let suffix = if cfg!(windows) {
        protocol::ID_SUFFIX_WINDOWS
    } else if tmux_mode == TmuxMode::TmuxNormalMode {
        let columns = get_terminal_columns();
        if columns > 0 && columns < 40 {
            print!("\n\n\x1b[2A\x1b[0J");
        } else {
            print!("\n\x1b[1A\x1b[0J");
        }
        protocol::ID_SUFFIX_TMUX
    } else {
        protocol::ID_SUFFIX_PLAIN
    };

    print!(
        "{}",
        protocol::transfer_marker(TransferMode::Send, &protocol::unique_id(suffix))
    );
    let _ = std::io::stdout().flush();

    if let Err(err) = terminal::enable_raw_mode() {
        eprintln!("{}", err);
        return -4;
    }

    let transfer = Arc::new(TrzszTransfer::new(real_stdout, true));
    let _pump = pump_stdin(Arc::clone(&transfer));
    if let Err(err) = handle_server_signal(Arc::clone(&transfer)) {
        transfer.server_error(&err);
        return 0;
    }

    if let Err(err) = send_files(&transfer, &args, &records, tmux_mode, tmux_pane_width) {
        transfer.server_error(&err);
    }
    0
}

fn send_files(
    transfer: &TrzszTransfer,
    args: &TszArgs,
    records: &[FileRecord],
    tmux_mode: TmuxMode,
    tmux_pane_width: i32,
) -> trzsz::Result<()> {
    let action = transfer.recv_action()?;

    if !action.confirm {
        transfer.server_exit("Cancelled");
        return Ok(());
    }

    let mut flags = args.transfer.clone();
    if flags.binary && !action.support_binary {
        flags.binary = false;
    }
    if flags.directory && !action.support_directory {
        return Err(TrzszError::fail(
            "The client doesn't support transfer directory",
        ));
    }

    transfer.send_config(
        &flags,
        &action,
        escape_table(flags.escape),
        tmux_mode,
        tmux_pane_width,
    )?;

    transfer.send_files(records, None)?;

    // the receiving client knows where the files landed; its EXIT
    // message is the farewell we print
    let msg = transfer.recv_exit()?;
    transfer.server_exit(&msg);
    Ok(())
}
