use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cdc_bridge::{
    bridge::{Bridge, RunMode, RunReport},
    checkpoint::KafkaCheckpoints,
    decoder::get_decoder,
    settings::Settings,
    source::{client_config, KafkaLog},
    store::ClickHouseStore,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(10);

#[doc(hidden)]
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: String,
    /// run mode
    #[arg(short, long, value_enum, default_value_t = RunMode::Realtime)]
    mode: RunMode,
    /// log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(&args).await {
        Ok(report) => {
            print_summary(&report);
            if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("bridge failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> anyhow::Result<RunReport> {
    let settings = Settings::new(&args.config).context("cannot load config")?;
    let decoder = get_decoder(settings.decoder(), settings.bridge.custom.clone())
        .context("cannot create decoder")?;

    let store = Arc::new(ClickHouseStore::new(&settings.clickhouse.url));
    store.ping().await.context("clickhouse is unreachable")?;
    info!(url = %settings.clickhouse.url, "clickhouse connection successful");

    let kafka = client_config(
        &settings.kafka.brokers,
        settings.consumer_group(),
        settings.kafka.session_timeout_ms.unwrap_or(6000),
    );
    let checkpoints = Arc::new(
        KafkaCheckpoints::new(
            &kafka,
            settings.consumer_group(),
            settings.topic_names(),
            CHECKPOINT_TIMEOUT,
        )
        .context("cannot create checkpoint store")?,
    );
    let log = KafkaLog::new(kafka, settings.topic_names());

    let bridge = Bridge::new(
        log,
        store,
        checkpoints,
        decoder,
        settings.routes(),
        settings.ingester_settings(),
    );

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, finishing in-flight batches");
        stop.cancel();
    });

    Ok(bridge.run(args.mode, cancel).await?)
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn print_summary(report: &RunReport) {
    println!("{} run finished", report.mode);
    for p in &report.partitions {
        println!(
            "  {} ({}): consumed {}, written {} in {} flushes, skipped {} ({} without operation), undecodable {}, committed {:?}",
            p.partition,
            p.entity,
            p.stats.consumed,
            p.stats.rows_written,
            p.stats.flushes,
            p.stats.skipped,
            p.stats.unknown_operations,
            p.stats.decode_errors,
            p.committed
        );
    }
    for (entity, consumed) in report.consumed_by_entity() {
        println!("  {entity}: {consumed} messages consumed");
    }
    for (table, count) in &report.table_counts {
        println!("  {table}: {count} records");
    }
    for failure in &report.failures {
        println!("  FAILED {failure}");
    }
}
