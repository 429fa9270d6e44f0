use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "ferry", about = "SOCKS5 forwarding proxy with host caching and connection reuse")]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the proxy server in the foreground
    Serve(ServeArgs),
    /// Manage ferry configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,

    /// Maximum concurrent client sessions
    #[arg(long, value_name = "N")]
    pub max_sessions: Option<usize>,

    /// Destination connect timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub connect_timeout: Option<u64>,

    /// Relay idle timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,

    /// Host cache TTL in seconds
    #[arg(long, value_name = "SECS")]
    pub resolver_ttl: Option<u64>,

    /// Maximum pooled connections, 0 for unbounded
    #[arg(long, value_name = "N")]
    pub pool_max_connections: Option<usize>,

    /// Maximum pooled connection lifetime in seconds
    #[arg(long, value_name = "SECS")]
    pub pool_max_lifetime: Option<u64>,

    /// Shutdown grace period in seconds
    #[arg(long, value_name = "SECS")]
    pub shutdown_grace: Option<u64>,

    /// Load an additional config file on top of defaults
    #[arg(long = "config", value_name = "PATH")]
    pub extra_config: Option<PathBuf>,

    /// Ignore all config files; use only CLI flags
    #[arg(long)]
    pub no_config: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a starter config file
    Init {
        #[arg(long)]
        global: bool,
    },
    /// Print the effective merged configuration
    Show {
        #[arg(long, value_enum, default_value = "toml")]
        format: OutputFormat,
    },
    /// Open config in $EDITOR
    Edit {
        #[arg(long)]
        global: bool,
    },
}

#[derive(ValueEnum, Clone, Copy)]
pub enum OutputFormat {
    Toml,
    Json,
}
