//! Metric collection
//!
//! The collector capability: raw sampling collectors read the latest value
//! of every planned field, windowed collectors aggregate samples over a
//! sliding time window. Both produce the same snapshot shape the renderer
//! and transforms consume.

mod sampling;
mod windowed;

#[cfg(test)]
mod tests;

pub use sampling::SamplingCollector;
pub use windowed::{clock_event_name, parse_clock_event_bits, WindowedCollector};

use crate::counters::Counter;
use crate::devices::{GpuInfo, GpuInstanceInfo};
use crate::error::Result;
use std::collections::BTreeMap;

/// Shared knobs every collector honours.
#[derive(Debug, Clone, Default)]
pub struct CollectorConfig {
    /// Empty when `--no-hostname` is set.
    pub hostname: String,
    pub replace_blanks_in_model_name: bool,
    pub collect_interval_ms: u64,
}

/// One emitted metric: a value plus the entity identity, sibling labels and
/// pod attributes that become the Prometheus label set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metric {
    pub value: String,
    pub gpu: String,
    pub gpu_uuid: String,
    pub device: String,
    pub model_name: String,
    pub mig_profile: String,
    pub gpu_instance_id: String,
    pub hostname: String,
    /// Values of sibling label-kind counters, by counter name.
    pub labels: BTreeMap<String, String>,
    /// Pod attribution, filled by the transform pipeline.
    pub attributes: BTreeMap<String, String>,
}

impl Metric {
    /// Identity fields for a whole GPU.
    pub fn for_gpu(value: String, gpu: &GpuInfo, config: &CollectorConfig) -> Self {
        Metric {
            value,
            gpu: gpu.gpu_id.to_string(),
            gpu_uuid: gpu.uuid.clone(),
            device: format!("nvidia{}", gpu.gpu_id),
            model_name: model_name(&gpu.model, config),
            hostname: config.hostname.clone(),
            ..Metric::default()
        }
    }

    /// Identity fields for a MIG GPU instance: GPU identity of the parent
    /// plus the MIG profile and instance id.
    pub fn for_gpu_instance(
        value: String,
        gpu: &GpuInfo,
        instance: &GpuInstanceInfo,
        config: &CollectorConfig,
    ) -> Self {
        let mut metric = Self::for_gpu(value, gpu, config);
        metric.mig_profile = instance.profile.clone();
        metric.gpu_instance_id = instance.nvml_instance_id.to_string();
        metric
    }

    /// Identity fields for a switch or one of its links.
    pub fn for_switch_entity(
        value: String,
        entity_id: u32,
        parent_switch: u32,
        config: &CollectorConfig,
    ) -> Self {
        Metric {
            value,
            gpu: entity_id.to_string(),
            device: format!("nvswitch{parent_switch}"),
            hostname: config.hostname.clone(),
            ..Metric::default()
        }
    }

    /// Identity fields for a CPU or one of its cores.
    pub fn for_cpu_entity(
        value: String,
        entity_id: u32,
        parent_cpu: u32,
        config: &CollectorConfig,
    ) -> Self {
        Metric {
            value,
            gpu: entity_id.to_string(),
            device: parent_cpu.to_string(),
            hostname: config.hostname.clone(),
            ..Metric::default()
        }
    }
}

fn model_name(model: &str, config: &CollectorConfig) -> String {
    if config.replace_blanks_in_model_name {
        model.split_whitespace().collect::<Vec<_>>().join("-")
    } else {
        model.to_string()
    }
}

/// Metrics grouped under one counter, in counter-file order.
#[derive(Debug, Clone)]
pub struct CounterMetrics {
    pub counter: Counter,
    pub metrics: Vec<Metric>,
}

/// One scrape's worth of metrics, published atomically.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub groups: Vec<CounterMetrics>,
}

impl Snapshot {
    pub fn push(&mut self, counter: &Counter, metric: Metric) {
        match self
            .groups
            .iter_mut()
            .find(|g| g.counter.field_name == counter.field_name)
        {
            Some(group) => group.metrics.push(metric),
            None => self.groups.push(CounterMetrics {
                counter: counter.clone(),
                metrics: vec![metric],
            }),
        }
    }

    /// Append another snapshot, preserving counter order.
    pub fn merge(&mut self, other: Snapshot) {
        for group in other.groups {
            for metric in group.metrics {
                self.push(&group.counter, metric);
            }
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Metric> {
        self.groups.iter_mut().flat_map(|g| g.metrics.iter_mut())
    }

    pub fn metric_count(&self) -> usize {
        self.groups.iter().map(|g| g.metrics.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// A source of metrics for one scrape.
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce this collector's slice of the scrape.
    fn get_metrics(&self) -> Result<Snapshot>;

    /// Release any DCGM handles the collector owns.
    fn cleanup(&self);
}

/// Render a sampled value for exposition. Mirrors the native formats:
/// integers in decimal, doubles in fixed notation, strings verbatim.
pub(crate) fn format_value(value: &crate::dcgm::FieldValue) -> String {
    use crate::dcgm::FieldValue;
    match value {
        FieldValue::Int64(v) => v.to_string(),
        FieldValue::Double(v) => format!("{v:.6}"),
        FieldValue::String(s) => s.clone(),
        FieldValue::Binary(_) => "failed-to-convert".to_string(),
    }
}
