use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tunnelsub_core::persistence::PersistenceMode;
use tunnelsub_core::provision::DEFAULT_MIRROR;
use tunnelsub_core::Scheme;

#[derive(Parser)]
#[command(name = "tunnelsub", version)]
#[command(about = "sing-box behind a Cloudflare tunnel, with a subscription endpoint", long_about = None)]
pub struct Cli {
    /// Installation directory (default: ~/.tunnelsub)
    #[arg(long, env = "FILE_PATH", global = true)]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download binaries, write configs, start everything and publish links
    Install(InstallArgs),
    /// Show component state and the installation record
    Status,
    /// Restart components and regenerate links
    Update {
        /// Re-download sing-box and cloudflared
        #[arg(long)]
        binaries: bool,
        /// Probe edge IPs with plain TCP only, for this run
        #[arg(long)]
        fast: bool,
        /// Run the full TLS probe even if the install used --fast
        #[arg(long, conflicts_with = "fast")]
        no_fast: bool,
    },
    /// Stop everything and remove the installation
    #[command(visible_alias = "del")]
    Uninstall,
    /// Print the generated links
    Cat,
    /// Start components from the saved record (used at boot)
    Start,
    /// Stop all components
    Stop,
    /// Run the subscription HTTP server in the foreground
    #[command(hide = true)]
    Serve,
}

#[derive(Args, Clone)]
pub struct InstallArgs {
    /// Client uuid (random if omitted)
    #[arg(long, env = "UUID")]
    pub uuid: Option<String>,

    /// Fixed tunnel hostname; required with --token
    #[arg(long, env = "ARGO_DOMAIN")]
    pub domain: Option<String>,

    /// Tunnel token or credentials JSON for a named tunnel
    #[arg(long, env = "ARGO_AUTH", hide_env_values = true)]
    pub token: Option<String>,

    /// Local port of the first proxy inbound (random if omitted)
    #[arg(long, env = "ARGO_PORT")]
    pub port: Option<u16>,

    /// Port of the subscription HTTP server
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub subs_port: u16,

    /// Path the subscription is served under
    #[arg(long, env = "SUB_PATH", default_value = "sub")]
    pub sub_path: String,

    /// Comma-separated protocols to enable
    #[arg(long, value_enum, value_delimiter = ',', default_value = "vmess")]
    pub protocols: Vec<ProtocolArg>,

    /// Node name used in link remarks
    #[arg(long, env = "NAME")]
    pub name: Option<String>,

    /// Extra CDN hostname or IP to emit links for
    #[arg(long, env = "CFIP")]
    pub cdn_host: Option<String>,

    #[arg(long, env = "CFPORT", default_value_t = 443)]
    pub cdn_port: u16,

    /// Aggregator to push nodes or the subscription URL to
    #[arg(long, env = "UPLOAD_URL")]
    pub upload_url: Option<String>,

    /// Public URL of this deployment
    #[arg(long, env = "PROJECT_URL")]
    pub project_url: Option<String>,

    /// Register PROJECT_URL with the keep-alive service
    #[arg(long, env = "AUTO_ACCESS")]
    pub auto_access: bool,

    /// Probe edge IPs with plain TCP only
    #[arg(long)]
    pub fast: bool,

    /// Skip edge IP probing entirely
    #[arg(long)]
    pub no_probe: bool,

    #[arg(long, value_enum, default_value = "cron")]
    pub persistence: PersistenceArg,

    /// GitHub mirror prefix used when a download fails ("" disables)
    #[arg(long, env = "GH_MIRROR", default_value = DEFAULT_MIRROR)]
    pub mirror: String,

    /// Tunnel restarts allowed while waiting for the quick-tunnel hostname
    #[arg(long, default_value_t = 3)]
    pub resolve_attempts: u32,

    /// Reinstall over an existing installation
    #[arg(long)]
    pub force: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ProtocolArg {
    Vmess,
    Vless,
    Trojan,
}

impl From<ProtocolArg> for Scheme {
    fn from(p: ProtocolArg) -> Self {
        match p {
            ProtocolArg::Vmess => Scheme::Vmess,
            ProtocolArg::Vless => Scheme::Vless,
            ProtocolArg::Trojan => Scheme::Trojan,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PersistenceArg {
    Cron,
    Systemd,
    None,
}

/// `update`'s one-run override of the stored `fast` setting.
pub fn fast_override(fast: bool, no_fast: bool) -> Option<bool> {
    match (fast, no_fast) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

impl From<PersistenceArg> for PersistenceMode {
    fn from(p: PersistenceArg) -> Self {
        match p {
            PersistenceArg::Cron => PersistenceMode::Cron,
            PersistenceArg::Systemd => PersistenceMode::Systemd,
            PersistenceArg::None => PersistenceMode::None,
        }
    }
}
