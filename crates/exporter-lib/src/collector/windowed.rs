//! Windowed collectors
//!
//! XID error counts and clock-event counts are not instantaneous readings:
//! each scrape queries every sample recorded in a sliding time window and
//! aggregates them per entity, either as raw values (XID) or by expanding a
//! bitmask of reasons (clock events). Field-group names are drawn from the
//! process-wide sequence so overlapping scrapes never collide.

use super::{format_value, Collector, CollectorConfig, Metric, Snapshot};
use crate::counters::{Counter, WindowedKind};
use crate::dcgm::{
    fields::{DCGM_FI_DEV_CLOCK_THROTTLE_REASONS, DCGM_FI_DEV_XID_ERRORS},
    DcgmClient, EntityGroup, EntityId, FieldValue, GroupHandle, Sample,
};
use crate::devices::Inventory;
use crate::error::{ExporterError, Result};
use crate::planner::unique_field_group_name;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Clock-event reason bits, low to high, with their exported names.
const CLOCK_EVENTS: &[(i64, &str)] = &[
    (0x0000_0000_0000_0001, "gpu_idle"),
    (0x0000_0000_0000_0002, "applications_clocks_setting"),
    (0x0000_0000_0000_0004, "power_cap"),
    (0x0000_0000_0000_0008, "hw_slowdown"),
    (0x0000_0000_0000_0010, "sync_boost"),
    (0x0000_0000_0000_0020, "sw_thermal_slowdown"),
    (0x0000_0000_0000_0040, "hw_thermal_slowdown"),
    (0x0000_0000_0000_0080, "hw_power_brake_slowdown"),
    (0x0000_0000_0000_0100, "display_clocks_setting"),
];

/// Expand a clock-event bitmask into one entry per set reason bit.
pub fn parse_clock_event_bits(raw: i64) -> Vec<i64> {
    CLOCK_EVENTS
        .iter()
        .filter(|(bit, _)| raw & bit != 0)
        .map(|(bit, _)| *bit)
        .collect()
}

/// Exported name of one clock-event reason bit.
pub fn clock_event_name(bit: i64) -> Option<&'static str> {
    CLOCK_EVENTS.iter().find(|(b, _)| *b == bit).map(|(_, n)| *n)
}

/// Sliding-window collector over a single GPU-scope field.
pub struct WindowedCollector {
    dcgm: Arc<dyn DcgmClient>,
    inventory: Arc<Inventory>,
    counter: Counter,
    kind: WindowedKind,
    window_ms: u64,
    label_counters: Vec<Counter>,
    config: CollectorConfig,
    field_id: u16,
    /// Group over every GPU; owned for the collector's lifetime.
    gpu_group: GroupHandle,
    /// Long-lived field group carrying the window-deep watch.
    watch_field_group: crate::dcgm::FieldGroupHandle,
}

impl WindowedCollector {
    pub fn new(
        dcgm: Arc<dyn DcgmClient>,
        inventory: Arc<Inventory>,
        counter: Counter,
        kind: WindowedKind,
        window_ms: u64,
        label_counters: Vec<Counter>,
        config: CollectorConfig,
    ) -> Result<Self> {
        let field_id = match kind {
            WindowedKind::XidErrors => DCGM_FI_DEV_XID_ERRORS,
            WindowedKind::ClockEvents => DCGM_FI_DEV_CLOCK_THROTTLE_REASONS,
        };

        let gpu_group = dcgm.create_group(&unique_field_group_name("dcgm_exp_gpus"))?;
        for gpu in &inventory.gpus {
            dcgm.add_entity_to_group(gpu_group, EntityId::new(EntityGroup::Gpu, gpu.gpu_id))?;
        }

        // The watch must retain enough history to cover the window, unlike
        // the same-scrape watches the planner installs.
        let watch_field_group =
            dcgm.field_group_create(&unique_field_group_name("dcgm_exp_watch"), &[field_id])?;
        dcgm.watch_fields_with_group(
            watch_field_group,
            gpu_group,
            config.collect_interval_ms.max(1) as i64 * 1000,
            window_ms as f64 / 1000.0,
            0,
        )?;

        Ok(Self {
            dcgm,
            inventory,
            counter,
            kind,
            window_ms,
            label_counters,
            config,
            field_id,
            gpu_group,
            watch_field_group,
        })
    }

    fn parse(&self, raw: i64) -> Vec<i64> {
        match self.kind {
            WindowedKind::XidErrors => vec![raw],
            WindowedKind::ClockEvents => parse_clock_event_bits(raw),
        }
    }

    fn fill_label(&self, labels: &mut BTreeMap<String, String>, parsed: i64) {
        match self.kind {
            WindowedKind::XidErrors => {
                labels.insert("xid".to_string(), parsed.to_string());
            }
            WindowedKind::ClockEvents => {
                if let Some(name) = clock_event_name(parsed) {
                    labels.insert("clock_event".to_string(), name.to_string());
                }
            }
        }
    }

    /// Count parsed values per GPU over the samples in the window.
    fn aggregate(&self, samples: &[Sample]) -> HashMap<u32, BTreeMap<i64, u64>> {
        let mut counts: HashMap<u32, BTreeMap<i64, u64>> = HashMap::new();
        for sample in samples {
            if sample.status != 0 || sample.value.is_blank() {
                continue;
            }
            let FieldValue::Int64(raw) = sample.value else {
                continue;
            };
            let per_entity = counts.entry(sample.entity.id).or_default();
            for parsed in self.parse(raw) {
                *per_entity.entry(parsed).or_default() += 1;
            }
        }
        counts
    }

    /// Sibling label values for one GPU, plus the window size label.
    fn base_labels(&self, gpu_id: u32) -> Result<BTreeMap<String, String>> {
        let mut labels = BTreeMap::new();
        labels.insert("window_size_in_ms".to_string(), self.window_ms.to_string());
        if self.label_counters.is_empty() {
            return Ok(labels);
        }
        let fields: Vec<u16> = self.label_counters.iter().map(|c| c.field_id).collect();
        let samples = self
            .dcgm
            .entities_get_latest_values(&[EntityId::new(EntityGroup::Gpu, gpu_id)], &fields, true)
            .map_err(ExporterError::from)?;
        for sample in samples {
            if sample.value.is_blank() {
                continue;
            }
            if let Some(counter) = self.label_counters.iter().find(|c| c.field_id == sample.field_id)
            {
                labels.insert(counter.field_name.clone(), format_value(&sample.value));
            }
        }
        Ok(labels)
    }

    fn emit_for_gpu(
        &self,
        snapshot: &mut Snapshot,
        gpu: &crate::devices::GpuInfo,
        instance: Option<&crate::devices::GpuInstanceInfo>,
        counts: &BTreeMap<i64, u64>,
    ) -> Result<()> {
        let base = self.base_labels(gpu.gpu_id)?;
        for (&parsed, &count) in counts {
            let mut metric = match instance {
                Some(instance) => {
                    Metric::for_gpu_instance(count.to_string(), gpu, instance, &self.config)
                }
                None => Metric::for_gpu(count.to_string(), gpu, &self.config),
            };
            metric.labels = base.clone();
            self.fill_label(&mut metric.labels, parsed);
            snapshot.push(&self.counter, metric);
        }
        Ok(())
    }
}

impl Collector for WindowedCollector {
    fn name(&self) -> &'static str {
        match self.kind {
            WindowedKind::XidErrors => "xid errors count",
            WindowedKind::ClockEvents => "clock events count",
        }
    }

    fn get_metrics(&self) -> Result<Snapshot> {
        // Fresh field group per scrape; the unique name keeps overlapping
        // scrapes from colliding.
        let scrape_fg = self
            .dcgm
            .field_group_create(&unique_field_group_name("dcgm_exp_scrape"), &[self.field_id])
            .map_err(ExporterError::from)?;
        self.dcgm.update_all_fields(true).map_err(ExporterError::from)?;

        let since_us = crate::dcgm::now_us() - self.window_ms as i64 * 1000;
        let result = self
            .dcgm
            .get_values_since(self.gpu_group, scrape_fg, since_us)
            .map_err(ExporterError::from);
        // The scrape field group never outlives the scrape.
        if let Err(e) = self.dcgm.field_group_destroy(scrape_fg) {
            debug!(error = %e, "failed to destroy scrape field group");
        }
        let (samples, _) = result?;

        let counts = self.aggregate(&samples);
        debug!(
            collector = self.name(),
            samples = samples.len(),
            entities = counts.len(),
            "window aggregated"
        );

        let mut snapshot = Snapshot::default();
        for gpu in self.inventory.monitored_gpus() {
            if let Some(counts) = counts.get(&gpu.gpu_id) {
                self.emit_for_gpu(&mut snapshot, gpu, None, counts)?;
            }
        }
        // On MIG-enabled GPUs the field is still sampled per GPU; emit one
        // set of metrics per monitored instance with instance identity.
        for (gpu, instance) in self.inventory.monitored_instances() {
            if let Some(counts) = counts.get(&gpu.gpu_id) {
                self.emit_for_gpu(&mut snapshot, gpu, Some(instance), counts)?;
            }
        }
        Ok(snapshot)
    }

    fn cleanup(&self) {
        if let Err(e) = self.dcgm.field_group_destroy(self.watch_field_group) {
            debug!(error = %e, "failed to destroy windowed watch field group");
        }
        if let Err(e) = self.dcgm.destroy_group(self.gpu_group) {
            debug!(error = %e, "failed to destroy windowed GPU group");
        }
    }
}
