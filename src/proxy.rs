//! Monitor orchestration.
//!
//! Activation builds the shared context, binds the interceptor and starts
//! periodic stats; deactivation tears all of it down again.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::activation::ControlChannel;
use crate::error::Result;
use crate::filter::{BlockPolicy, Blocklist};
use crate::pipeline::{MonitorContext, PipelineConfig};
use crate::process::{ProcessCorrelator, ProcfsCorrelator};
use crate::record::{LogSink, OutputFormat, RecordSink, StdoutSink};
use crate::transport::udp::UdpTransport;

/// Configuration for the monitor.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address clients send DNS queries to (e.g., 127.0.0.1:5353)
    pub bind_addr: SocketAddr,
    /// Upstream resolver allowed queries are forwarded to
    pub upstream: SocketAddr,
    /// Control endpoint used for unload requests
    pub control_addr: SocketAddr,
    /// Block list to enforce; nothing is blocked without one
    pub blocklist: Option<PathBuf>,
    pub pipeline: PipelineConfig,
    pub output: OutputFormat,
    /// Route records through the log instead of stdout
    pub daemon: bool,
    pub stats_interval: Duration,
}

/// An activated monitor.
pub struct Monitor {
    context: Arc<MonitorContext>,
    local_addr: SocketAddr,
    transport: JoinHandle<()>,
    stats: JoinHandle<()>,
}

impl Monitor {
    /// Load the block list, build the context and bind the interceptor.
    pub async fn activate(
        config: &ProxyConfig,
        correlator: Arc<dyn ProcessCorrelator>,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self> {
        let blocklist = match &config.blocklist {
            Some(path) => Blocklist::load(path)?,
            None => Blocklist::new(),
        };
        let policy = BlockPolicy::new(blocklist);
        let context = Arc::new(MonitorContext::new(
            &config.pipeline,
            policy,
            correlator,
            sink,
        ));

        let transport = UdpTransport::bind(config.bind_addr).await?;
        let local_addr = transport.local_addr()?;
        let transport = transport.start(config.upstream, context.clone());
        let stats = spawn_stats_reporter(context.clone(), config.stats_interval);

        info!(
            "DNS monitor listening on {} ({} domains blocked, {:?} mode)",
            local_addr,
            context.blocked_count(),
            config.pipeline.block_mode
        );
        info!("Forwarding to upstream: {}", config.upstream);

        Ok(Self {
            context,
            local_addr,
            transport,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<MonitorContext> {
        &self.context
    }

    /// Stop intercepting and drop per-run state. Returns the number of
    /// records emitted over the monitor's lifetime.
    ///
    /// In-flight flows are aborted with the transport; any that are mid-write
    /// finish before the context shuts down and nothing is written after.
    pub async fn deactivate(self) -> u64 {
        self.transport.abort();
        self.stats.abort();
        if let Err(e) = self.transport.await {
            if !e.is_cancelled() {
                warn!(error = %e, "transport task failed");
            }
        }
        self.context.shutdown();
        self.context.emitted_total()
    }
}

fn spawn_stats_reporter(context: Arc<MonitorContext>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            let stats = context.stats_snapshot_and_reset();
            info!(
                "[stats] uptime={}s cache={} pending={} queries={} responses={} blocked={} rejected={} unattributed={} records={}",
                stats.uptime_secs,
                context.cache_len(),
                context.pending_len(),
                stats.queries,
                stats.responses,
                stats.blocked,
                stats.rejected,
                stats.unattributed,
                stats.emitted_total
            );
        }
    })
}

/// Run the monitor until interrupted or asked to unload.
pub async fn run(config: ProxyConfig) -> Result<()> {
    let sink: Arc<dyn RecordSink> = if config.daemon {
        Arc::new(LogSink::new(config.output))
    } else {
        Arc::new(StdoutSink::new(config.output))
    };

    let monitor = Monitor::activate(&config, Arc::new(ProcfsCorrelator::new()), sink).await?;
    let control = ControlChannel::bind(config.control_addr).await?;
    info!("Control endpoint on {}", config.control_addr);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "failed to listen for interrupt");
            }
            info!("Interrupted, deactivating");
        }
        result = control.wait_for_unload() => {
            match result {
                Ok(from) => info!(%from, "Unload requested, deactivating"),
                Err(e) => warn!(error = %e, "control endpoint failed, deactivating"),
            }
        }
    }

    let total = monitor.deactivate().await;
    info!("Monitor stopped after {} records", total);

    Ok(())
}
