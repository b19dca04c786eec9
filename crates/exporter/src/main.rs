//! dcgm-exporter - Prometheus exporter for NVIDIA GPU telemetry
//!
//! Connects to DCGM (embedded or remote hostengine), discovers GPUs,
//! NvSwitches and CPUs, watches the configured fields and serves the
//! resulting metrics over HTTP.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use exporter_lib::collector::{Collector, SamplingCollector, WindowedCollector};
use exporter_lib::counters::load_counter_file;
use exporter_lib::dcgm::{self, DcgmClient};
use exporter_lib::devices::Inventory;
use exporter_lib::kubernetes::PodMapper;
use exporter_lib::planner::WatchPlan;
use exporter_lib::server;
use exporter_lib::transform::Transform;
use exporter_lib::{ExporterError, MetricsState, Pipeline};

mod settings;

use settings::Settings;

/// How long shutdown waits for in-flight scrapes before giving up.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

enum RunOutcome {
    Exit,
    Reload,
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::parse();

    let default_level = if settings.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting dcgm-exporter");
    settings.validate().context("invalid configuration")?;

    // SIGHUP restarts the whole start-up sequence with fresh counters and
    // a fresh inventory.
    loop {
        match run(&settings).await? {
            RunOutcome::Exit => break,
            RunOutcome::Reload => info!("reload requested, restarting"),
        }
    }
    Ok(())
}

async fn run(settings: &Settings) -> Result<RunOutcome> {
    let dcgm = dcgm::connect(&settings.dcgm_options()?).context("DCGM initialisation failed")?;

    let result = run_with_dcgm(settings, &dcgm).await;
    dcgm.shutdown();
    result
}

async fn run_with_dcgm(settings: &Settings, dcgm: &Arc<dyn DcgmClient>) -> Result<RunOutcome> {
    let counters = load_counter_file(&settings.collectors, dcgm)
        .with_context(|| format!("loading counters from {}", settings.collectors.display()))?;
    info!(
        counters = counters.dcgm_counters.len(),
        windowed = counters.exporter_counters.len(),
        "counters loaded"
    );

    let inventory = Arc::new(
        Inventory::discover(dcgm, settings.device_options()?, settings.fake_gpus)
            .context("device inventory failed")?,
    );

    let mut plan = WatchPlan::create(dcgm, &inventory, &counters.dcgm_counters, settings.collect_interval)
        .context("field watch planning failed")?;

    let config = settings.collector_config();
    let mut collectors: Vec<Box<dyn Collector>> = Vec::new();
    for class_plan in &plan.classes {
        collectors.push(Box::new(SamplingCollector::new(
            dcgm.clone(),
            inventory.clone(),
            class_plan.class,
            class_plan.field_ids.clone(),
            &counters.dcgm_counters,
            config.clone(),
        )));
    }
    for exporter_counter in &counters.exporter_counters {
        let collector = WindowedCollector::new(
            dcgm.clone(),
            inventory.clone(),
            exporter_counter.counter.clone(),
            exporter_counter.kind,
            settings.window_for(exporter_counter.kind),
            counters.labels.clone(),
            config.clone(),
        )
        .context("windowed collector setup failed")?;
        collectors.push(Box::new(collector));
    }

    let mut transforms: Vec<Box<dyn Transform>> = Vec::new();
    if settings.kubernetes {
        transforms.push(Box::new(PodMapper::new(
            settings.pod_resources_kubelet_socket.clone(),
            settings.kubernetes_gpu_id_type()?,
            settings.use_old_namespace,
        )));
    }

    let (pipeline, snapshot_rx) = Pipeline::new(
        collectors,
        transforms,
        inventory.clone(),
        settings.collect_interval,
    );

    let (stop_tx, _) = broadcast::channel(4);
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<ExporterError>(1);

    let state = MetricsState::new();
    let consumer = tokio::spawn(server::consume_snapshots(
        state.clone(),
        snapshot_rx,
        stop_tx.subscribe(),
    ));
    let http_fatal = fatal_tx.clone();
    let server_options = settings.server_options();
    let http_stop = stop_tx.subscribe();
    let http = tokio::spawn(async move {
        if let Err(e) = server::serve(server_options, state, http_stop).await {
            error!(error = %e, "HTTP server failed");
            let _ = http_fatal.send(e).await;
        }
    });
    let producer = tokio::spawn(pipeline.run(stop_tx.subscribe(), fatal_tx));

    let outcome = wait_for_signal(&mut fatal_rx).await;

    // Stop order: HTTP and consumer first, then the producer, which
    // releases its watches on exit.
    let _ = stop_tx.send(());
    let workers = async {
        if let Err(e) = http.await {
            warn!(error = %e, "HTTP task panicked");
        } else {
            info!("HTTP server stopped");
        }
        let _ = consumer.await;
        let _ = producer.await;
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, workers).await.is_err() {
        error!("workers did not stop in time");
        plan.cleanup(dcgm);
        anyhow::bail!("shutdown timed out");
    }
    plan.cleanup(dcgm);

    match outcome {
        Signalled::Stop => Ok(RunOutcome::Exit),
        Signalled::Reload => Ok(RunOutcome::Reload),
        Signalled::Fatal(e) => Err(e).context("fatal runtime error"),
    }
}

enum Signalled {
    Stop,
    Reload,
    Fatal(ExporterError),
}

async fn wait_for_signal(fatal_rx: &mut mpsc::Receiver<ExporterError>) -> Signalled {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            return Signalled::Stop;
        }
    };
    let mut int = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "cannot install SIGINT handler");
            return Signalled::Stop;
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "cannot install SIGQUIT handler");
            return Signalled::Stop;
        }
    };
    let mut hup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "cannot install SIGHUP handler");
            return Signalled::Stop;
        }
    };

    tokio::select! {
        _ = term.recv() => {
            info!("received SIGTERM");
            Signalled::Stop
        }
        _ = int.recv() => {
            info!("received SIGINT");
            Signalled::Stop
        }
        _ = quit.recv() => {
            info!("received SIGQUIT");
            Signalled::Stop
        }
        _ = hup.recv() => {
            info!("received SIGHUP");
            Signalled::Reload
        }
        fatal = fatal_rx.recv() => {
            match fatal {
                Some(e) => Signalled::Fatal(e),
                // Producer gone without reporting; treat as stop.
                None => Signalled::Stop,
            }
        }
    }
}
