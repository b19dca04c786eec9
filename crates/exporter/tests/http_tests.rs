//! End-to-end tests: counter file through pipeline to the HTTP surface.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use tokio::sync::{broadcast, mpsc};
use tower::ServiceExt;

use exporter_lib::collector::{Collector, SamplingCollector, WindowedCollector};
use exporter_lib::counters::load_counter_file;
use exporter_lib::dcgm::{
    fields::{DCGM_FI_DEV_GPU_TEMP, DCGM_FI_DEV_XID_ERRORS, DCGM_FI_DRIVER_VERSION},
    now_us, DcgmClient, EmbeddedEngine, EngineTopology, EntityGroup, EntityId, FieldValue,
};
use exporter_lib::devices::{DeviceOptions, Inventory};
use exporter_lib::planner::WatchPlan;
use exporter_lib::server::{self, create_router};
use exporter_lib::{CollectorConfig, MetricsState, Pipeline};

const COUNTERS_CSV: &str = "\
# Temperature and driver info
DCGM_FI_DEV_GPU_TEMP,gauge,Temperature (in C).
DCGM_FI_DRIVER_VERSION,label,Driver version.
DCGM_EXP_XID_ERRORS_COUNT,gauge,Count of XID errors within the window.
";

struct Stack {
    engine: Arc<EmbeddedEngine>,
    client: Arc<dyn DcgmClient>,
    inventory: Arc<Inventory>,
}

fn stack() -> Stack {
    let engine = Arc::new(EmbeddedEngine::with_topology(EngineTopology::fake_gpus(1)));
    let client: Arc<dyn DcgmClient> = engine.clone();
    let inventory =
        Arc::new(Inventory::discover(&client, DeviceOptions::default(), false).unwrap());
    Stack {
        engine,
        client,
        inventory,
    }
}

fn counters_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(COUNTERS_CSV.as_bytes()).unwrap();
    file
}

async fn get(app: axum::Router, path: &str) -> (StatusCode, String) {
    let response = app
        .oneshot(Request::get(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn counters_to_metrics_endpoint() {
    let stack = stack();
    let gpu0 = EntityId::new(EntityGroup::Gpu, 0);
    stack
        .engine
        .push_sample(gpu0, DCGM_FI_DEV_GPU_TEMP, FieldValue::Int64(42), now_us());
    stack.engine.push_sample(
        gpu0,
        DCGM_FI_DRIVER_VERSION,
        FieldValue::String("535.86.10".to_string()),
        now_us(),
    );
    for xid in [31, 31, 48] {
        stack.engine.push_sample(
            gpu0,
            DCGM_FI_DEV_XID_ERRORS,
            FieldValue::Int64(xid),
            now_us() - 1_000_000,
        );
    }

    let file = counters_file();
    let counters = load_counter_file(file.path(), &stack.client).unwrap();
    assert_eq!(counters.dcgm_counters.len(), 2);
    assert_eq!(counters.exporter_counters.len(), 1);

    let mut plan = WatchPlan::create(&stack.client, &stack.inventory, &counters.dcgm_counters, 1000)
        .unwrap();
    let config = CollectorConfig {
        hostname: "node-1".to_string(),
        collect_interval_ms: 1000,
        ..CollectorConfig::default()
    };

    let mut collectors: Vec<Box<dyn Collector>> = Vec::new();
    for class_plan in &plan.classes {
        collectors.push(Box::new(SamplingCollector::new(
            stack.client.clone(),
            stack.inventory.clone(),
            class_plan.class,
            class_plan.field_ids.clone(),
            &counters.dcgm_counters,
            config.clone(),
        )));
    }
    for exporter_counter in &counters.exporter_counters {
        collectors.push(Box::new(
            WindowedCollector::new(
                stack.client.clone(),
                stack.inventory.clone(),
                exporter_counter.counter.clone(),
                exporter_counter.kind,
                5000,
                counters.labels.clone(),
                config.clone(),
            )
            .unwrap(),
        ));
    }

    let (pipeline, snapshot_rx) = Pipeline::new(collectors, Vec::new(), stack.inventory.clone(), 60_000);
    let (stop_tx, _) = broadcast::channel(1);
    let (fatal_tx, _fatal_rx) = mpsc::channel(1);

    let state = MetricsState::new();
    let consumer = tokio::spawn(server::consume_snapshots(
        state.clone(),
        snapshot_rx,
        stop_tx.subscribe(),
    ));
    let producer = tokio::spawn(pipeline.run(stop_tx.subscribe(), fatal_tx));

    // Health flips once the immediate first scrape lands.
    let app = create_router(state.clone(), None);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (status, _) = get(app.clone(), "/health").await;
        if status == StatusCode::OK {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no snapshot produced");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let (status, body) = get(app.clone(), "/metrics").await;
    assert_eq!(status, StatusCode::OK);

    // Raw sampling with identity and the driver-version label attached.
    assert!(body.contains("# HELP DCGM_FI_DEV_GPU_TEMP Temperature (in C).\n"));
    assert!(body.contains("# TYPE DCGM_FI_DEV_GPU_TEMP gauge\n"));
    let temp_line = body
        .lines()
        .find(|l| l.starts_with("DCGM_FI_DEV_GPU_TEMP{"))
        .unwrap();
    assert!(temp_line.contains("gpu=\"0\""));
    assert!(temp_line.contains("device=\"nvidia0\""));
    assert!(temp_line.contains("UUID=\"GPU-"));
    assert!(temp_line.contains("Hostname=\"node-1\""));
    assert!(temp_line.contains("DCGM_FI_DRIVER_VERSION=\"535.86.10\""));
    assert!(temp_line.ends_with(" 42"));

    // The label row never renders as a metric of its own.
    assert!(!body.contains("\nDCGM_FI_DRIVER_VERSION{"));

    // Windowed XID counts per distinct code.
    let xid_lines: Vec<&str> = body
        .lines()
        .filter(|l| l.starts_with("DCGM_EXP_XID_ERRORS_COUNT{"))
        .collect();
    assert_eq!(xid_lines.len(), 2);
    assert!(xid_lines
        .iter()
        .any(|l| l.contains("xid=\"31\"") && l.ends_with(" 2")));
    assert!(xid_lines
        .iter()
        .any(|l| l.contains("xid=\"48\"") && l.ends_with(" 1")));
    for line in &xid_lines {
        assert!(line.contains("window_size_in_ms=\"5000\""));
        assert!(line.contains("DCGM_FI_DRIVER_VERSION=\"535.86.10\""));
    }

    let (_, index) = get(app.clone(), "/").await;
    assert!(index.contains("/metrics"));

    stop_tx.send(()).unwrap();
    producer.await.unwrap();
    consumer.await.unwrap();
    plan.cleanup(&stack.client);
}

#[tokio::test]
async fn unknown_counter_fails_startup() {
    let stack = stack();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"DCGM_FI_NOT_A_FIELD,gauge,Bogus.\n").unwrap();
    let err = load_counter_file(file.path(), &stack.client).unwrap_err();
    assert!(err.to_string().contains("DCGM_FI_NOT_A_FIELD"));
}
