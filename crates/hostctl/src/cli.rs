use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hostctl", version, about = "Test host controller")]
pub(crate) struct Args {
    #[arg(long, default_value = "config/hostctl.toml")]
    pub(crate) config: PathBuf,
    /// Target host; the local host when omitted.
    #[arg(long)]
    pub(crate) host: Option<String>,
    #[arg(long, default_value = "root")]
    pub(crate) user: String,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Run a command on the host and print its output.
    Run {
        /// Run under the configured privilege-elevation tool.
        #[arg(long, default_value_t = false)]
        sudo: bool,
        /// Give up after this many seconds.
        #[arg(long)]
        timeout: Option<f64>,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Record an observation session for a fixed duration.
    Capture {
        #[arg(long, default_value_t = 10.0)]
        duration: f64,
        #[arg(long)]
        interface: Option<String>,
        /// Additional peer addresses for the capture filter; repeatable.
        #[arg(long = "peer")]
        peers: Vec<String>,
    },
    /// Mount the configured export.
    Mount,
    /// Unmount the configured export.
    Umount,
    /// Drop outbound TCP traffic to ADDR:PORT, holding the partition
    /// until the duration elapses or Ctrl-C, then lift it.
    Drop {
        target: String,
        #[arg(long)]
        duration: Option<f64>,
    },
    /// Flush all firewall rules installed by previous drops.
    Reset,
}
