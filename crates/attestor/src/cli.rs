use std::path::PathBuf;

use clap::Parser;
use reqwest::Url;

use attestor_engine::proxy::ProxyPoolConfig;

const DEFAULT_PROVIDER_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_MAILBOX_URL: &str = "http://127.0.0.1:8025";

fn default_provider_url() -> Url {
    Url::parse(DEFAULT_PROVIDER_URL).expect("DEFAULT_PROVIDER_URL must be a valid URL")
}

fn default_mailbox_url() -> Url {
    Url::parse(DEFAULT_MAILBOX_URL).expect("DEFAULT_MAILBOX_URL must be a valid URL")
}

#[derive(Debug, Clone, Parser)]
#[command(name = "attestor", version, about = "Batch identity-verification runner")]
pub struct Cli {
    /// Verification provider base URL.
    #[arg(long, env = "ATTESTOR_PROVIDER_URL", default_value_t = default_provider_url())]
    pub provider_url: Url,

    /// Mailbox API base URL (out-of-band confirmation codes).
    #[arg(long, env = "ATTESTOR_MAILBOX_URL", default_value_t = default_mailbox_url())]
    pub mailbox_url: Url,

    /// Candidate records file (`FIRST|LAST|branch|YYYY-MM-DD[|YYYY-MM-DD]` rows).
    #[arg(long, env = "ATTESTOR_RECORDS", default_value = "data.txt")]
    pub records: PathBuf,

    /// Proxy list file (`host:port` or `host:port:user:pass` per line).
    /// Without one, jobs run over the direct connection.
    #[arg(long, env = "ATTESTOR_PROXIES")]
    pub proxies: Option<PathBuf>,

    /// State directory for the consumed-record set and the outcome ledger.
    /// Defaults to the XDG state directory.
    #[arg(long, env = "ATTESTOR_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Number of verification jobs to run in parallel.
    #[arg(
        short = 'p',
        long,
        env = "ATTESTOR_PARALLEL",
        default_value_t = 4,
        value_parser = clap::value_parser!(u16).range(1..=64)
    )]
    pub parallel: u16,

    /// Per-user daily verification quota (0 disables the check).
    #[arg(long, env = "ATTESTOR_DAILY_QUOTA", default_value_t = 0)]
    pub daily_quota: u32,

    /// Submit at most this many records, then wait for them to finish.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Seconds to wait for the provider's decision before timing out.
    #[arg(long, default_value_t = 120)]
    pub decision_deadline_secs: u64,

    /// Seconds to wait for the out-of-band confirmation code.
    #[arg(long, default_value_t = 300)]
    pub oob_deadline_secs: u64,

    /// Proxy health score; an endpoint is quarantined after this many
    /// consecutive transport failures.
    #[arg(long, default_value_t = ProxyPoolConfig::DEFAULT_HEALTH)]
    pub proxy_health: u32,

    /// Seconds a quarantined proxy stays excluded from checkout.
    #[arg(long, default_value_t = 600)]
    pub proxy_cooldown_secs: u64,

    /// Append records from a file to the inventory and exit.
    #[arg(long, value_name = "FILE")]
    pub import: Option<PathBuf>,

    /// Print ledger statistics and exit.
    #[arg(long, default_value_t = false)]
    pub stats: bool,
}
