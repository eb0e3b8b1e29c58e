use clap::Parser;
use serde::Serialize;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tablet_retention::{
    InMemoryConsensus, InMemoryStorage, MaintenanceManagerStatus, MetricsSnapshot, PeerRole,
    RetentionConfig, RetentionContext, StreamOptions, SystemClock, TableSummaries, TabletDescriptor,
    TabletId, TabletScope, TabletState,
};

/// Drives a scripted workload through the retention layer with in-memory
/// consensus and storage, then prints the resulting status as JSON.
#[derive(Debug, Parser)]
#[command(name = "retention-sim", version)]
struct Args {
    /// JSON configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_filter: String,
    #[arg(long, default_value_t = 4)]
    tablets: usize,
    /// Entries appended to every tablet per round.
    #[arg(long, default_value_t = 100)]
    entries_per_round: usize,
    #[arg(long, default_value_t = 3)]
    rounds: usize,
    /// Delete the stream after the last round and drain its anchors.
    #[arg(long)]
    delete_stream: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    tables: TableSummaries,
    maintenance: MaintenanceManagerStatus,
    metrics: MetricsSnapshot,
    truncated_before: Vec<(TabletId, u64)>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_filter))
        .init();

    let config = match &args.config {
        Some(path) => RetentionConfig::load(path)?,
        None => RetentionConfig::default(),
    };
    let consensus = Arc::new(InMemoryConsensus::new());
    let storage = Arc::new(InMemoryStorage::new());
    let context = RetentionContext::new(
        config,
        consensus.clone(),
        storage.clone(),
        Arc::new(SystemClock),
    )?;

    let mut tablets = Vec::with_capacity(args.tablets);
    for n in 0..args.tablets {
        let id = format!("tablet-{n:03}");
        context.add_tablet(TabletDescriptor::new(&id, "orders-id", "shop", "orders"))?;
        let tablet = TabletId::new(id);
        context
            .tablets()
            .transition(&tablet, TabletState::Bootstrapping)?;
        context.tablets().transition(&tablet, TabletState::Running)?;
        consensus.set_role(&tablet, PeerRole::Leader);
        tablets.push(tablet);
    }

    let stream = context
        .cdc()
        .create_stream(StreamOptions::new(TabletScope::Namespace("shop".into())))?;
    log::info!("event=sim_stream_created stream={}", stream);

    for round in 0..args.rounds {
        for tablet in &tablets {
            let last = consensus.append_many(tablet, 1, args.entries_per_round);
            storage.record_write(tablet, last.index, (args.entries_per_round as u64) * 128);
        }
        // Flush first so log GC has a persisted index to chase.
        context.maintenance().run_cycle_inline();
        for tablet in &tablets {
            let response = context.cdc().poll(&stream, tablet).await?;
            context
                .cdc()
                .acknowledge_cursor(&stream, tablet, &response.resume_cursor)?;
        }
        let results = context.maintenance().run_cycle_inline();
        log::info!(
            "event=sim_round_complete round={} ops={} failed={}",
            round,
            results.len(),
            results.iter().filter(|result| result.is_err()).count()
        );
    }

    if args.delete_stream {
        context.cdc().delete_stream(&stream)?;
        let released = context.cdc().drain_pending_releases();
        context.maintenance().run_cycle_inline();
        log::info!(
            "event=sim_stream_deleted stream={} released={}",
            stream,
            released
        );
    }

    let report = Report {
        tables: context.status().table_summaries(),
        maintenance: context.status().maintenance_manager_status(),
        metrics: context.metrics().snapshot(),
        truncated_before: tablets
            .iter()
            .map(|tablet| (tablet.clone(), consensus.truncated_before(tablet)))
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    context.shutdown().await;
    Ok(())
}
