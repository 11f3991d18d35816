use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use dnsmonitor::activation::{self, DEFAULT_REQUEST_TIMEOUT};
use dnsmonitor::filter::BlockMode;
use dnsmonitor::pipeline::PipelineConfig;
use dnsmonitor::proxy::{self, ProxyConfig};
use dnsmonitor::record::OutputFormat;
use dnsmonitor::{Error, Result};

#[derive(Parser)]
#[command(name = "dnsmonitor")]
#[command(about = "Monitor DNS lookups per process and optionally block domains", long_about = None)]
struct Args {
    /// Local address to receive DNS queries on
    #[arg(short, long, default_value = "127.0.0.1:5353")]
    bind: String,

    /// Upstream DNS server (host:port)
    #[arg(short, long, default_value = "8.8.8.8:53")]
    upstream: String,

    /// Log records instead of printing them to stdout
    #[arg(short, long)]
    daemon: bool,

    /// Emit records as JSON
    #[arg(long)]
    json: bool,

    /// Pretty-print JSON records (implies --json)
    #[arg(long)]
    pretty: bool,

    /// Block the domains listed in this file (one per line)
    #[arg(long, value_name = "FILE")]
    block: Option<PathBuf>,

    /// How blocked queries are stopped
    #[arg(long, value_enum, default_value_t = BlockMode::Respond)]
    block_mode: BlockMode,

    /// Maximum number of address-to-domain mappings kept
    #[arg(long, default_value_t = 4096)]
    cache_capacity: usize,

    /// Time budget for looking up a flow's process, in milliseconds
    #[arg(long, default_value_t = 250)]
    identify_timeout_ms: u64,

    /// Process lookups allowed to run at once
    #[arg(long, default_value_t = 16)]
    max_lookups: usize,

    /// Control endpoint of the running monitor
    #[arg(long, default_value = "127.0.0.1:5354")]
    control: String,

    /// Ask a running monitor to deactivate, then exit
    #[arg(long)]
    unload: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn parse_addr(value: &str) -> Result<SocketAddr> {
    value.parse().map_err(|source| Error::InvalidAddress {
        value: value.to_string(),
        source,
    })
}

impl Args {
    fn output(&self) -> OutputFormat {
        match (self.json, self.pretty) {
            (_, true) => OutputFormat::PrettyJson,
            (true, false) => OutputFormat::Json,
            (false, false) => OutputFormat::Text,
        }
    }

    fn into_config(self) -> Result<ProxyConfig> {
        Ok(ProxyConfig {
            bind_addr: parse_addr(&self.bind)?,
            upstream: parse_addr(&self.upstream)?,
            control_addr: parse_addr(&self.control)?,
            output: self.output(),
            daemon: self.daemon,
            pipeline: PipelineConfig {
                cache_capacity: self.cache_capacity,
                identify_timeout: Duration::from_millis(self.identify_timeout_ms),
                max_concurrent_lookups: self.max_lookups,
                block_mode: self.block_mode,
                ..PipelineConfig::default()
            },
            blocklist: self.block,
            stats_interval: Duration::from_secs(60),
        })
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> Result<()> {
    if args.unload {
        let control = parse_addr(&args.control)?;
        activation::request_unload(control, DEFAULT_REQUEST_TIMEOUT).await?;
        println!("Monitor at {control} deactivated");
        return Ok(());
    }

    proxy::run(args.into_config()?).await
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
