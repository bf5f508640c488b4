//! Handshake wire types and the initiation marker.
//!
//! The ACT and CFG payloads are JSON objects riding inside regular
//! protocol frames; both sides keep byte-identical copies of the CFG
//! after the handshake. Field names and defaults follow the wire schema
//! of the original implementations, so absent fields from older peers
//! fall back rather than fail.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::escape::EscapeTable;

/// Version advertised in the ACT payload and the initiation marker.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Highest transfer protocol this crate speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default max chunk size when the CFG omits it.
pub const DEFAULT_MAX_BUF_SIZE: i64 = 10 * 1024 * 1024;

/// Handshake sent by the initiating side: willingness plus capabilities.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferAction {
    pub lang: String,
    pub version: String,
    pub confirm: bool,
    #[serde(default = "default_newline")]
    pub newline: String,
    #[serde(default)]
    pub protocol: u32,
    #[serde(rename = "binary", default = "default_true")]
    pub support_binary: bool,
    #[serde(rename = "support_dir", default)]
    pub support_directory: bool,
}

impl TransferAction {
    pub fn new(confirm: bool, remote_is_windows: bool) -> TransferAction {
        let windows = cfg!(windows) || remote_is_windows;
        TransferAction {
            lang: "rust".to_string(),
            version: VERSION.to_string(),
            confirm,
            newline: if windows { "!\n" } else { "\n" }.to_string(),
            protocol: PROTOCOL_VERSION,
            support_binary: !windows,
            support_directory: true,
        }
    }
}

/// Negotiated transfer parameters, identical on both peers. Optional
/// knobs are omitted from the wire when unset, mirroring the original's
/// sparse CFG object.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TransferConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lang: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub quiet: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub binary: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub directory: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub overwrite: bool,
    #[serde(default = "default_timeout")]
    pub timeout: i64,
    #[serde(default = "default_newline")]
    pub newline: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub protocol: u32,
    #[serde(rename = "bufsize", default = "default_bufsize")]
    pub max_buf_size: i64,
    #[serde(
        rename = "escape_chars",
        default,
        skip_serializing_if = "EscapeTable::is_empty"
    )]
    pub escape_codes: EscapeTable,
    #[serde(rename = "tmux_pane_width", default, skip_serializing_if = "is_zero_i32")]
    pub tmux_pane_columns: i32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub tmux_output_junk: bool,
}

impl Default for TransferConfig {
    fn default() -> TransferConfig {
        TransferConfig {
            lang: String::new(),
            quiet: false,
            binary: false,
            directory: false,
            overwrite: false,
            timeout: default_timeout(),
            newline: default_newline(),
            protocol: 0,
            max_buf_size: default_bufsize(),
            escape_codes: EscapeTable::default(),
            tmux_pane_columns: 0,
            tmux_output_junk: false,
        }
    }
}

fn default_newline() -> String {
    "\n".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> i64 {
    20
}

fn default_bufsize() -> i64 {
    DEFAULT_MAX_BUF_SIZE
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

/// What the remote side is about to do with the terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferMode {
    /// Upload files to the remote (`trz`).
    Receive,
    /// Upload a directory tree to the remote (`trz -d`).
    ReceiveDirectory,
    /// Download files from the remote (`tsz`).
    Send,
}

impl TransferMode {
    fn tag(self) -> char {
        match self {
            TransferMode::Receive => 'R',
            TransferMode::ReceiveDirectory => 'D',
            TransferMode::Send => 'S',
        }
    }

    fn from_tag(tag: &str) -> Option<TransferMode> {
        match tag {
            "R" => Some(TransferMode::Receive),
            "D" => Some(TransferMode::ReceiveDirectory),
            "S" => Some(TransferMode::Send),
            _ => None,
        }
    }
}

/// Unique-id platform suffixes carried by the marker.
pub const ID_SUFFIX_WINDOWS: &str = "10";
pub const ID_SUFFIX_TMUX: &str = "20";
pub const ID_SUFFIX_PLAIN: &str = "00";

/// Marker-unique id: unix millis mod 1e11, plus a platform suffix.
pub fn unique_id(suffix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    format!("{}{}", millis % 100_000_000_000, suffix)
}

/// The one line the remote prints on its stdout to start a transfer:
/// `ESC 7 BEL ::TRZSZ:TRANSFER:<MODE>:<VERSION>:<ID> CR LF`.
pub fn transfer_marker(mode: TransferMode, unique_id: &str) -> String {
    format!(
        "\x1b7\x07::TRZSZ:TRANSFER:{}:{}:{}\r\n",
        mode.tag(),
        VERSION,
        unique_id
    )
}

/// Scan a terminal output line for the initiation marker. Exposed for
/// client-side integrations; tolerates leading noise on the line.
pub fn parse_transfer_marker(line: &str) -> Option<(TransferMode, String, String)> {
    let start = line.find("::TRZSZ:TRANSFER:")?;
    let rest = &line[start + "::TRZSZ:TRANSFER:".len()..];
    let rest = rest.trim_end_matches(['\r', '\n']);
    let mut tokens = rest.splitn(3, ':');
    let mode = TransferMode::from_tag(tokens.next()?)?;
    let version = tokens.next()?.to_string();
    let id = tokens.next()?.to_string();
    (!version.is_empty() && !id.is_empty()).then_some((mode, version, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escape::escape_table;

    #[test]
    fn action_wire_names() {
        let action = TransferAction::new(true, false);
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains(r#""lang":"rust""#));
        assert!(json.contains(r#""binary":true"#));
        assert!(json.contains(r#""support_dir":true"#));
        assert!(json.contains(r#""protocol":1"#));

        let parsed: TransferAction = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, action);
    }

    #[test]
    fn action_defaults_for_sparse_peers() {
        let parsed: TransferAction =
            serde_json::from_str(r#"{"lang":"go","version":"0.1.0","confirm":true}"#).unwrap();
        assert_eq!(parsed.newline, "\n");
        assert!(parsed.support_binary);
        assert!(!parsed.support_directory);
        assert_eq!(parsed.protocol, 0);
    }

    #[test]
    fn windows_peer_flips_newline_and_binary() {
        let action = TransferAction::new(true, true);
        assert_eq!(action.newline, "!\n");
        assert!(!action.support_binary);
    }

    #[test]
    fn config_omits_unset_knobs() {
        let cfg = TransferConfig {
            lang: "rust".into(),
            protocol: 1,
            ..TransferConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("quiet"));
        assert!(!json.contains("binary"));
        assert!(!json.contains("escape_chars"));
        assert!(!json.contains("tmux"));
        assert!(json.contains(r#""bufsize":10485760"#));
        assert!(json.contains(r#""timeout":20"#));
    }

    #[test]
    fn config_round_trips_with_escape_table() {
        let cfg = TransferConfig {
            lang: "rust".into(),
            binary: true,
            overwrite: true,
            protocol: 1,
            escape_codes: escape_table(true),
            tmux_pane_columns: 120,
            tmux_output_junk: true,
            ..TransferConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: TransferConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn sparse_config_gets_defaults() {
        let parsed: TransferConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, TransferConfig::default());
    }

    #[test]
    fn marker_round_trip() {
        let id = unique_id(ID_SUFFIX_TMUX);
        assert!(id.ends_with("20"));
        let marker = transfer_marker(TransferMode::ReceiveDirectory, &id);
        assert!(marker.starts_with("\x1b7\x07::TRZSZ:TRANSFER:D:"));
        assert!(marker.ends_with("\r\n"));

        let (mode, version, parsed_id) = parse_transfer_marker(&marker).unwrap();
        assert_eq!(mode, TransferMode::ReceiveDirectory);
        assert_eq!(version, VERSION);
        assert_eq!(parsed_id, id);
    }

    #[test]
    fn marker_survives_prefix_noise() {
        let line = "prompt$ \x1b7\x07::TRZSZ:TRANSFER:S:1.0.0:12345600\r\n";
        let (mode, version, id) = parse_transfer_marker(line).unwrap();
        assert_eq!(mode, TransferMode::Send);
        assert_eq!(version, "1.0.0");
        assert_eq!(id, "12345600");
        assert!(parse_transfer_marker("no marker").is_none());
    }
}
