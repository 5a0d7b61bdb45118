//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML settings file in the data directory
//! - Merging CLI with file settings (CLI takes precedence)

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use nwshare::core::config::TransferSettings;

/// nwshare - serverless peer-to-peer file sharing.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Directory for all persistent data (settings, received files, peers).
    /// Defaults to ~/.nwshare/
    #[clap(long, global = true)]
    pub conf: Option<PathBuf>,

    /// Bytes per chunk message.
    #[clap(long, global = true)]
    pub chunk_size: Option<usize>,

    /// Maximum number of open peer links.
    #[clap(long, global = true)]
    pub max_peers: Option<usize>,

    /// Display name for this peer.
    #[clap(long, global = true)]
    pub name: Option<String>,

    /// Copy received files to the download directory.
    #[clap(long, global = true)]
    pub auto_download: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Send a file from one in-process peer to N others and verify it arrives intact.
    Demo {
        file: PathBuf,

        /// Number of receiving peers.
        #[clap(long, default_value_t = 1)]
        peers: usize,

        /// Use WebRTC data channels instead of the in-memory transport.
        #[clap(long)]
        webrtc: bool,
    },
    /// Manage received files.
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum HistoryAction {
    /// List stored files, newest first.
    List,
    /// Delete one stored file.
    Delete { id: Uuid },
    /// Remove files past their expiry.
    Prune,
    /// Copy a stored file into a directory.
    Export { id: Uuid, dest: PathBuf },
    /// Remove every stored file.
    Clear,
}

impl Args {
    pub fn load() -> Self {
        let mut args = Args::parse();
        // Resolve relative paths to absolute before anything else runs.
        args.conf = args.conf.map(Self::resolve_path);
        args
    }

    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Merge file settings with CLI values (CLI takes precedence) and validate.
    pub fn merge(&self, mut file: TransferSettings) -> Result<TransferSettings> {
        if let Some(chunk_size) = self.chunk_size {
            file.chunk_size = chunk_size;
        }
        if let Some(max_peers) = self.max_peers {
            file.max_peers = max_peers;
        }
        if let Some(name) = &self.name {
            file.display_name = name.clone();
        }
        if self.auto_download {
            file.auto_download = true;
        }
        file.validate()?;
        Ok(file)
    }

    /// `EnvFilter` directives for the chosen verbosity.
    ///
    /// webrtc_ice logs "unknown TransactionID" for late STUN responses, which
    /// are normal, so it is held at error below trace.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn,nwshare=info,webrtc_ice::agent=error",
            1 => "info,webrtc_ice::agent=error",
            2 => "debug,webrtc_ice::agent=error",
            _ => "trace",
        }
    }
}
