//! Collector behaviour tests against the embedded engine.

use super::*;
use crate::counters::{analyze_counters, Counter, CounterSet, PromType, WindowedKind};
use crate::dcgm::{
    fields::{
        DCGM_FI_DEV_CLOCK_THROTTLE_REASONS, DCGM_FI_DEV_GPU_TEMP, DCGM_FI_DEV_POWER_USAGE,
        DCGM_FI_DEV_XID_ERRORS, DCGM_FI_DRIVER_VERSION,
    },
    now_us, DcgmClient, EmbeddedEngine, EngineTopology, EntityGroup, EntityId, FieldValue,
    SimMigInstance, INT64_BLANK,
};
use crate::devices::{DeviceOptions, Inventory};
use crate::planner::EntityClass;
use std::sync::Arc;

struct Fixture {
    engine: Arc<EmbeddedEngine>,
    client: Arc<dyn DcgmClient>,
    inventory: Arc<Inventory>,
}

fn fixture(topology: EngineTopology) -> Fixture {
    let engine = Arc::new(EmbeddedEngine::with_topology(topology));
    let client: Arc<dyn DcgmClient> = engine.clone();
    let inventory =
        Arc::new(Inventory::discover(&client, DeviceOptions::default(), false).unwrap());
    Fixture {
        engine,
        client,
        inventory,
    }
}

fn counter_set(client: &Arc<dyn DcgmClient>, rows: &[(&str, &str, &str)]) -> CounterSet {
    let rows: Vec<_> = rows
        .iter()
        .map(|(n, t, h)| (n.to_string(), t.to_string(), h.to_string()))
        .collect();
    analyze_counters(&rows, client).unwrap()
}

fn gpu_sampler(f: &Fixture, set: &CounterSet) -> SamplingCollector {
    let field_ids: Vec<u16> = set.dcgm_counters.iter().map(|c| c.field_id).collect();
    SamplingCollector::new(
        f.client.clone(),
        f.inventory.clone(),
        EntityClass::Gpu,
        field_ids,
        &set.dcgm_counters,
        CollectorConfig {
            hostname: "node-1".to_string(),
            ..CollectorConfig::default()
        },
    )
}

fn gpu0() -> EntityId {
    EntityId::new(EntityGroup::Gpu, 0)
}

#[test]
fn single_gpu_temperature_sample() {
    let f = fixture(EngineTopology::fake_gpus(1));
    let set = counter_set(&f.client, &[("DCGM_FI_DEV_GPU_TEMP", "gauge", "temp")]);
    f.engine
        .push_sample(gpu0(), DCGM_FI_DEV_GPU_TEMP, FieldValue::Int64(42), now_us());

    let snapshot = gpu_sampler(&f, &set).get_metrics().unwrap();
    assert_eq!(snapshot.metric_count(), 1);
    let metric = &snapshot.groups[0].metrics[0];
    assert_eq!(metric.value, "42");
    assert_eq!(metric.gpu, "0");
    assert_eq!(metric.device, "nvidia0");
    assert!(metric.gpu_uuid.starts_with("GPU-"));
    assert_eq!(metric.hostname, "node-1");
}

#[test]
fn sentinel_samples_emit_nothing() {
    let f = fixture(EngineTopology::fake_gpus(1));
    let set = counter_set(&f.client, &[("DCGM_FI_DEV_GPU_TEMP", "gauge", "temp")]);
    f.engine.push_sample(
        gpu0(),
        DCGM_FI_DEV_GPU_TEMP,
        FieldValue::Int64(INT64_BLANK),
        now_us(),
    );

    let snapshot = gpu_sampler(&f, &set).get_metrics().unwrap();
    assert_eq!(snapshot.metric_count(), 0);
}

#[test]
fn label_counters_decorate_sibling_metrics() {
    let f = fixture(EngineTopology::fake_gpus(1));
    let set = counter_set(
        &f.client,
        &[
            ("DCGM_FI_DRIVER_VERSION", "label", "drv"),
            ("DCGM_FI_DEV_POWER_USAGE", "gauge", "power"),
        ],
    );
    f.engine.push_sample(
        gpu0(),
        DCGM_FI_DRIVER_VERSION,
        FieldValue::String("535.86.10".to_string()),
        now_us(),
    );
    f.engine
        .push_sample(gpu0(), DCGM_FI_DEV_POWER_USAGE, FieldValue::Double(42.0), now_us());

    let snapshot = gpu_sampler(&f, &set).get_metrics().unwrap();
    // The label row itself emits no metric.
    assert_eq!(snapshot.metric_count(), 1);
    let metric = &snapshot.groups[0].metrics[0];
    assert_eq!(metric.value, "42.000000");
    assert_eq!(
        metric.labels.get("DCGM_FI_DRIVER_VERSION").map(String::as_str),
        Some("535.86.10")
    );
}

#[test]
fn model_name_blanks_become_dashes() {
    let f = fixture(EngineTopology::fake_gpus(1));
    let set = counter_set(&f.client, &[("DCGM_FI_DEV_GPU_TEMP", "gauge", "temp")]);
    f.engine
        .push_sample(gpu0(), DCGM_FI_DEV_GPU_TEMP, FieldValue::Int64(30), now_us());

    let field_ids: Vec<u16> = set.dcgm_counters.iter().map(|c| c.field_id).collect();
    let collector = SamplingCollector::new(
        f.client.clone(),
        f.inventory.clone(),
        EntityClass::Gpu,
        field_ids,
        &set.dcgm_counters,
        CollectorConfig {
            replace_blanks_in_model_name: true,
            ..CollectorConfig::default()
        },
    );
    let snapshot = collector.get_metrics().unwrap();
    let model = &snapshot.groups[0].metrics[0].model_name;
    assert!(!model.contains(' '));
    assert!(!model.contains("--"));
    assert_eq!(model, "NVIDIA-H100-80GB-HBM3");
}

fn windowed(f: &Fixture, kind: WindowedKind, window_ms: u64) -> WindowedCollector {
    let name = match kind {
        WindowedKind::XidErrors => "DCGM_EXP_XID_ERRORS_COUNT",
        WindowedKind::ClockEvents => "DCGM_EXP_CLOCK_EVENTS_COUNT",
    };
    let counter = Counter {
        field_id: 0,
        field_name: name.to_string(),
        prom_type: PromType::Gauge,
        help: String::new(),
    };
    WindowedCollector::new(
        f.client.clone(),
        f.inventory.clone(),
        counter,
        kind,
        window_ms,
        Vec::new(),
        CollectorConfig {
            collect_interval_ms: 1000,
            ..CollectorConfig::default()
        },
    )
    .unwrap()
}

#[test]
fn xid_window_counts_per_distinct_code() {
    let f = fixture(EngineTopology::fake_gpus(1));
    let now = now_us();
    for (value, offset) in [(31, 4_000_000), (31, 2_000_000), (48, 1_000_000)] {
        f.engine.push_sample(
            gpu0(),
            DCGM_FI_DEV_XID_ERRORS,
            FieldValue::Int64(value),
            now - offset,
        );
    }
    // Outside the 5 s window; never counted.
    f.engine.push_sample(
        gpu0(),
        DCGM_FI_DEV_XID_ERRORS,
        FieldValue::Int64(31),
        now - 600_000_000,
    );

    let collector = windowed(&f, WindowedKind::XidErrors, 5000);
    let snapshot = collector.get_metrics().unwrap();
    assert_eq!(snapshot.metric_count(), 2);

    let metrics = &snapshot.groups[0].metrics;
    let by_xid: Vec<(&str, &str)> = metrics
        .iter()
        .map(|m| (m.labels["xid"].as_str(), m.value.as_str()))
        .collect();
    assert!(by_xid.contains(&("31", "2")));
    assert!(by_xid.contains(&("48", "1")));
    for metric in metrics {
        assert_eq!(metric.labels["window_size_in_ms"], "5000");
        assert_eq!(metric.gpu, "0");
    }
    collector.cleanup();
}

#[test]
fn clock_event_bitmask_expands_per_reason() {
    let f = fixture(EngineTopology::fake_gpus(1));
    f.engine.push_sample(
        gpu0(),
        DCGM_FI_DEV_CLOCK_THROTTLE_REASONS,
        FieldValue::Int64(0x0000_0000_0000_000C),
        now_us(),
    );

    let collector = windowed(&f, WindowedKind::ClockEvents, 300_000);
    let snapshot = collector.get_metrics().unwrap();
    assert_eq!(snapshot.metric_count(), 2);

    let mut names: Vec<&str> = snapshot.groups[0]
        .metrics
        .iter()
        .map(|m| m.labels["clock_event"].as_str())
        .collect();
    names.sort_unstable();
    assert_eq!(names, vec!["hw_slowdown", "power_cap"]);
    for metric in &snapshot.groups[0].metrics {
        assert_eq!(metric.value, "1");
    }
    collector.cleanup();
}

#[test]
fn xid_window_covers_mixed_mig_fleet() {
    let mut topology = EngineTopology::fake_gpus(2);
    topology.gpus[0].mig_instances.push(SimMigInstance {
        entity_id: 100,
        nvml_instance_id: 3,
        profile: "1g.5gb".to_string(),
        compute_instances: Vec::new(),
    });
    let engine = Arc::new(EmbeddedEngine::with_topology(topology).synthesizing());
    let client: Arc<dyn DcgmClient> = engine.clone();
    let inventory =
        Arc::new(Inventory::discover(&client, DeviceOptions::default(), false).unwrap());
    let f = Fixture {
        engine,
        client,
        inventory,
    };

    let now = now_us();
    f.engine
        .push_sample(gpu0(), DCGM_FI_DEV_XID_ERRORS, FieldValue::Int64(31), now - 1_000_000);
    f.engine.push_sample(
        EntityId::new(EntityGroup::Gpu, 1),
        DCGM_FI_DEV_XID_ERRORS,
        FieldValue::Int64(48),
        now - 1_000_000,
    );

    let collector = windowed(&f, WindowedKind::XidErrors, 5000);
    let snapshot = collector.get_metrics().unwrap();
    // GPU 0 reports through its MIG instance, GPU 1 as a whole device.
    let metrics = &snapshot.groups[0].metrics;
    assert_eq!(metrics.len(), 2);
    let mig = metrics.iter().find(|m| m.gpu == "0").unwrap();
    assert_eq!(mig.gpu_instance_id, "3");
    assert_eq!(mig.mig_profile, "1g.5gb");
    assert_eq!(mig.labels["xid"], "31");
    let plain = metrics.iter().find(|m| m.gpu == "1").unwrap();
    assert!(plain.gpu_instance_id.is_empty());
    assert_eq!(plain.labels["xid"], "48");
    collector.cleanup();
}

#[test]
fn scrape_field_groups_never_leak() {
    let f = fixture(EngineTopology::fake_gpus(1));
    let collector = windowed(&f, WindowedKind::XidErrors, 5000);
    let baseline = f.engine.field_group_count();
    for _ in 0..3 {
        collector.get_metrics().unwrap();
    }
    assert_eq!(f.engine.field_group_count(), baseline);
    collector.cleanup();
    assert_eq!(f.engine.field_group_count(), baseline - 1);
}

#[test]
fn bitmask_parser_matches_reason_bits() {
    assert_eq!(parse_clock_event_bits(0x1), vec![0x1]);
    assert_eq!(parse_clock_event_bits(0xC), vec![0x4, 0x8]);
    assert!(parse_clock_event_bits(0).is_empty());
    assert_eq!(clock_event_name(0x4), Some("power_cap"));
    assert_eq!(clock_event_name(0x3), None);
}

#[test]
fn connection_loss_is_fatal_for_the_scrape() {
    let f = fixture(EngineTopology::fake_gpus(1));
    let set = counter_set(&f.client, &[("DCGM_FI_DEV_GPU_TEMP", "gauge", "temp")]);
    let collector = gpu_sampler(&f, &set);
    f.engine.kill_connection();
    let err = collector.get_metrics().unwrap_err();
    assert!(err.is_fatal());
}
