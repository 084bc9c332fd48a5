//! ipve-datapath: replay frames through the endpoint datapath.
//!
//! Reads one command per line from stdin:
//!
//! ```text
//! egress <lxc_id> <frame hex>
//! ingress <lxc_id> <src_label> <frame hex>
//! stats
//! ```
//!
//! and prints the disposition plus the frame as it leaves the datapath.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use ipve_datapath::{ConnTrackCleaner, Datapath, DatapathConfig, Disposition, LogMonitor, Packet};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ipve-datapath")]
#[command(about = "Per-endpoint forwarding decision engine")]
struct Args {
    /// Datapath configuration (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds between connection tracking sweeps
    #[arg(long, default_value_t = ipve_datapath::conntrack::CLEANUP_INTERVAL_SECS)]
    gc_interval: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config = %args.config.display(), "ipve-datapath starting...");

    let config = DatapathConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let dp = Arc::new(Datapath::from_config(&config, Arc::new(LogMonitor))?);

    let cleaner = ConnTrackCleaner::start(dp.ct.clone(), Duration::from_secs(args.gc_interval.max(1)));

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = sigint.recv() => { info!("Received SIGINT"); break; }
            _ = sigterm.recv() => { info!("Received SIGTERM"); break; }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Err(e) = run_command(&dp, line) {
                    warn!(error = %e, "Invalid command");
                }
            }
        }
    }

    cleaner.stop();
    info!(conntrack_entries = dp.ct.len(), "ipve-datapath stopped");
    Ok(())
}

fn run_command(dp: &Datapath, line: &str) -> anyhow::Result<()> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["egress", lxc_id, frame] => {
            let mut pkt = Packet::new(hex::decode(frame)?);
            let disposition = dp.handle_egress(lxc_id.parse()?, &mut pkt);
            print_result(&disposition, &pkt);
        }
        ["ingress", lxc_id, src_label, frame] => {
            let mut pkt = Packet::new(hex::decode(frame)?);
            let disposition = dp.handle_ingress(lxc_id.parse()?, src_label.parse()?, &mut pkt);
            print_result(&disposition, &pkt);
        }
        ["stats"] => {
            println!("conntrack {}", dp.ct.len());
            for (key, value) in dp.metrics.snapshot() {
                println!(
                    "reason {} dir {} packets {} bytes {}",
                    key.reason, key.dir, value.count, value.bytes
                );
            }
        }
        _ => bail!("unknown command: {line}"),
    }
    Ok(())
}

fn print_result(disposition: &Disposition, pkt: &Packet) {
    match disposition {
        Disposition::Accept(forward) => println!("accept {forward:?} {}", hex::encode(pkt.data())),
        Disposition::Drop(reason) => println!("drop {} {reason}", reason.code()),
    }
}
