//! Command-line interface for fsentryd.
//!
//! The daemon only exposes a `start` command; the query client is a
//! separate process speaking the shared-memory protocol.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// fsentry daemon - watches directories and records file changes
#[derive(Debug, Parser)]
#[command(name = "fsentryd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "FSENTRYD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, env = "FSENTRYD_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the daemon
    Start {
        /// Override shared-memory segment path
        #[arg(short, long, env = "FSENTRY_SEGMENT")]
        segment: Option<PathBuf>,

        /// Append one JSON line per processed change to this file
        #[arg(long)]
        audit_log: Option<PathBuf>,
    },
}

impl Cli {
    /// Get the segment path from command arguments or default
    pub fn segment_path(&self) -> PathBuf {
        match &self.command {
            Command::Start { segment, .. } => segment
                .clone()
                .unwrap_or_else(fsentry_protocol::segment_path_with_xdg_fallback),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_start() {
        let cli = Cli::parse_from(["fsentryd", "start"]);
        assert!(matches!(cli.command, Command::Start { .. }));
    }

    #[test]
    fn test_cli_parse_start_with_options() {
        let cli = Cli::parse_from([
            "fsentryd",
            "start",
            "--segment",
            "/tmp/test.shm",
            "--audit-log",
            "/tmp/audit.jsonl",
        ]);
        match cli.command {
            Command::Start { segment, audit_log } => {
                assert_eq!(segment, Some(PathBuf::from("/tmp/test.shm")));
                assert_eq!(audit_log, Some(PathBuf::from("/tmp/audit.jsonl")));
            }
        }
    }

    #[test]
    fn test_cli_segment_path_falls_back_to_default() {
        let cli = Cli::parse_from(["fsentryd", "start"]);
        assert!(!cli.segment_path().as_os_str().is_empty());
    }
}
