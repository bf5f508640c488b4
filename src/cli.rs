//! Shared CLI fragment for the trz/tsz binaries.

use clap::Parser;

/// Flags common to sending and receiving.
#[derive(Clone, Debug, Parser)]
pub struct TransferArgs {
    /// quiet (hide progress bar)
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// yes, overwrite existing file(s)
    #[arg(short = 'y', long)]
    pub overwrite: bool,

    /// binary transfer mode, faster for binary files
    #[arg(short = 'b', long)]
    pub binary: bool,

    /// escape all known control characters
    #[arg(short = 'e', long)]
    pub escape: bool,

    /// transfer directories and files
    #[arg(short = 'd', long)]
    pub directory: bool,

    /// max buffer chunk size (1K<=N<=1G). (default: 10M)
    #[arg(
        short = 'B',
        long = "bufsize",
        value_name = "N",
        value_parser = parse_buffer_size,
        default_value = "10M"
    )]
    pub bufsize: i64,

    /// timeout ( N seconds ) for each buffer chunk. N <= 0 means never timeout
    #[arg(short = 't', long, value_name = "N", default_value_t = 20, allow_hyphen_values = true)]
    pub timeout: i64,
}

/// Parse sizes like `2048`, `32k`, `10M`, `1gb`; bounds 1K..=1G.
pub fn parse_buffer_size(s: &str) -> Result<i64, String> {
    let s = s.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if digits_end == 0 {
        return Err(format!("invalid size {}", s));
    }
    let value: i64 = s[..digits_end]
        .parse()
        .map_err(|_| format!("invalid size {}", s))?;
    let multiplier = match s[digits_end..].to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        _ => return Err(format!("invalid size {}", s)),
    };
    let size = value.checked_mul(multiplier).ok_or("greater than 1G")?;
    if size < 1024 {
        return Err("less than 1K".to_string());
    }
    if size > 1024 * 1024 * 1024 {
        return Err("greater than 1G".to_string());
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_and_suffixed_sizes() {
        assert_eq!(parse_buffer_size("2048").unwrap(), 2048);
        assert_eq!(parse_buffer_size("2048b").unwrap(), 2048);
        assert_eq!(parse_buffer_size("32k").unwrap(), 32 * 1024);
        assert_eq!(parse_buffer_size("32KB").unwrap(), 32 * 1024);
        assert_eq!(parse_buffer_size("10M").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_buffer_size("10mb").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_buffer_size("1g").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn bounds_are_enforced() {
        assert_eq!(parse_buffer_size("1023").unwrap_err(), "less than 1K");
        assert_eq!(parse_buffer_size("2g").unwrap_err(), "greater than 1G");
        assert_eq!(parse_buffer_size("9999999T").unwrap_err(), "invalid size 9999999T");
        assert!(parse_buffer_size("x10m").is_err());
        assert!(parse_buffer_size("").is_err());
    }

    #[test]
    fn args_parse_with_defaults() {
        let args = TransferArgs::parse_from(["test"]);
        assert_eq!(args.bufsize, 10 * 1024 * 1024);
        assert_eq!(args.timeout, 20);
        assert!(!args.binary && !args.directory && !args.overwrite);

        let args = TransferArgs::parse_from(["test", "-y", "-d", "-B", "64k", "-t", "-1"]);
        assert!(args.overwrite && args.directory);
        assert_eq!(args.bufsize, 64 * 1024);
        assert_eq!(args.timeout, -1);
    }
}
