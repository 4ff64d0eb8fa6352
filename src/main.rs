use clap::Parser;
use miflorad::{
    ble::BtleplugTransport,
    config::{Cli, Config},
    metrics::{formatter_for, run_formatter},
    publish::{
        run_publisher, topic_for, MqttPublisher, PublishStats, Publisher, StdoutPublisher,
    },
    scheduler::{run_until, SweepScheduler, SweepStats},
    Result, VERSION,
};
use std::{process::ExitCode, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const METRIC_CHANNEL_CAPACITY: usize = 1;
const LINE_CHANNEL_CAPACITY: usize = 10;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_cli(cli)?;
    info!("🌱 miflorad {} starting", VERSION);

    let transport = BtleplugTransport::new(config.adapter).await?;
    let publisher: Box<dyn Publisher> = match &config.broker {
        Some(broker) => Box::new(MqttPublisher::connect(broker).await?),
        None => {
            info!("No broker configured, writing metrics to stdout");
            Box::new(StdoutPublisher)
        }
    };

    let (metric_tx, metric_rx) = mpsc::channel(METRIC_CHANNEL_CAPACITY);
    let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let grace_period = config.sweep.grace_period();
    let mut scheduler = SweepScheduler::new(
        transport,
        config.peripherals,
        config.sweep,
        metric_tx,
        cancel_rx,
    )?;

    let formatter = tokio::spawn(run_formatter(
        metric_rx,
        line_tx,
        formatter_for(config.format, &config.prefix),
    ));

    let topic = topic_for(&config.topic_prefix);
    let publisher = tokio::spawn(async move {
        let stats = run_publisher(line_rx, publisher.as_ref(), &topic).await;
        if let Err(e) = publisher.close().await {
            warn!("Failed to close publisher: {}", e);
        }
        stats
    });

    if config.oneshot {
        scheduler.sweep().await;
        report_sweeper(scheduler.shutdown().await);
    } else if let Some(stats) = run_until(scheduler, &cancel_tx, shutdown_signal()).await {
        report_sweeper(stats);
    }

    drain(formatter, publisher, grace_period).await;
    Ok(())
}

fn report_sweeper(stats: SweepStats) {
    info!(
        "Sweeper stopped after {} successes and {} failures",
        stats.successes, stats.failures
    );
}

/// Let the formatter and publisher flush what the sweeper left behind
async fn drain(
    formatter: JoinHandle<()>,
    publisher: JoinHandle<PublishStats>,
    limit: Duration,
) {
    let flushed = tokio::time::timeout(limit, async {
        if let Err(e) = formatter.await {
            error!("Formatter task failed: {}", e);
        }
        publisher.await
    })
    .await;

    match flushed {
        Ok(Ok(stats)) => info!(
            "Published {} lines, dropped {}",
            stats.published, stats.dropped
        ),
        Ok(Err(e)) => error!("Publisher task failed: {}", e),
        Err(_) => warn!("Pending metric lines not flushed in time"),
    }
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Can't listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                warn!("Can't listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
