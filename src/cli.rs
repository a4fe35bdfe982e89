//! CLI / entry point (C12): process argument parsing (spec.md §6).
use clap::Parser;

/// Interactive client for a versioned, binary file-transfer protocol,
/// spoken over a secure-shell subprocess or a direct socket.
#[derive(Parser, Debug)]
#[clap(name = "sftp", version)]
pub struct Args {
    /// Host to connect to, or user@host.
    pub destination: Option<String>,

    /// I/O buffer size in bytes for each READ/WRITE.
    #[clap(long, default_value_t = 32 * 1024)]
    pub buffer: u32,

    /// Read commands from this file instead of running interactively.
    #[clap(long)]
    pub batch: Option<String>,

    /// Secure-shell program to exec for the subprocess transport.
    #[clap(long, default_value = "ssh")]
    pub program: String,

    /// Maximum number of pipelined requests in flight during a transfer.
    #[clap(long, default_value_t = 8)]
    pub requests: usize,

    /// Remote subsystem name to request.
    #[clap(long, default_value = "sftp")]
    pub subsystem: String,

    /// Highest protocol version to request in INIT (3-6).
    #[clap(long = "sftp-version", default_value_t = 6)]
    pub sftp_version: u32,

    /// Swap SYMLINK's operand order for known-broken v3 servers.
    #[clap(long)]
    pub quirk_reverse_symlink: bool,

    /// Abort the session on the first command failure.
    #[clap(long, overrides_with = "no_stop_on_error")]
    pub stop_on_error: bool,

    /// Keep running after a command failure (the default).
    #[clap(long)]
    pub no_stop_on_error: bool,

    /// Show the single-line transfer progress indicator.
    #[clap(long, overrides_with = "no_progress")]
    pub progress: bool,

    /// Suppress the transfer progress indicator.
    #[clap(long)]
    pub no_progress: bool,

    /// Raise log verbosity; repeat for more detail.
    #[clap(long, action = clap::ArgAction::Count)]
    pub debug: u8,

    /// Connect directly to this host over TCP instead of spawning a subprocess.
    #[clap(long)]
    pub host: Option<String>,

    /// TCP port to use with `--host`.
    #[clap(long, default_value_t = 22)]
    pub port: u16,

    /// Restrict socket/subprocess connections to IPv4.
    #[clap(long, overrides_with = "ipv6")]
    pub ipv4: bool,

    /// Restrict socket/subprocess connections to IPv6.
    #[clap(long)]
    pub ipv6: bool,
}

impl Args {
    /// Resolved `stop_on_error`, `--no-stop-on-error` taking precedence
    /// when both were somehow set (clap's `overrides_with` already prevents
    /// that in practice).
    pub fn stop_on_error(&self) -> bool {
        self.stop_on_error && !self.no_stop_on_error
    }

    /// Resolved progress setting; on by default per spec.md §3.
    pub fn progress_enabled(&self) -> bool {
        !self.no_progress
    }
}
