//! Prometheus text exposition
//!
//! Turns a snapshot into the text format scraped from `/metrics`. Label
//! sets differ per metric because pod attributes and sibling labels are
//! per-entity, so lines are written directly rather than through a metric
//! registry.

use std::fmt::Write;

use crate::collector::Snapshot;
use crate::counters::PromType;
use crate::error::{ExporterError, Result};

/// Render one snapshot. Counters keep file order, metrics keep collection
/// order, labels and attributes are sorted by key.
pub fn render(snapshot: &Snapshot) -> Result<String> {
    let mut out = String::new();
    for group in &snapshot.groups {
        if group.metrics.is_empty() {
            continue;
        }
        let name = &group.counter.field_name;
        writeln!(out, "# HELP {name} {}", group.counter.help)
            .map_err(|e| ExporterError::Scrape(format!("render failed: {e}")))?;
        writeln!(out, "# TYPE {name} {}", type_name(group.counter.prom_type))
            .map_err(|e| ExporterError::Scrape(format!("render failed: {e}")))?;
        for metric in &group.metrics {
            let mut labels: Vec<(&str, &str)> = vec![("gpu", &metric.gpu)];
            if !metric.gpu_uuid.is_empty() {
                labels.push(("UUID", &metric.gpu_uuid));
            }
            labels.push(("device", &metric.device));
            if !metric.model_name.is_empty() {
                labels.push(("modelName", &metric.model_name));
            }
            if !metric.mig_profile.is_empty() {
                labels.push(("GPU_I_PROFILE", &metric.mig_profile));
                labels.push(("GPU_I_ID", &metric.gpu_instance_id));
            }
            if !metric.hostname.is_empty() {
                labels.push(("Hostname", &metric.hostname));
            }
            for (key, value) in &metric.labels {
                labels.push((key, value));
            }
            for (key, value) in &metric.attributes {
                labels.push((key, value));
            }

            out.push_str(name);
            out.push('{');
            for (i, (key, value)) in labels.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write!(out, "{key}=\"{}\"", escape(value))
                    .map_err(|e| ExporterError::Scrape(format!("render failed: {e}")))?;
            }
            out.push_str("} ");
            out.push_str(&metric.value);
            out.push('\n');
        }
    }
    Ok(out)
}

fn type_name(prom_type: PromType) -> &'static str {
    match prom_type {
        PromType::Counter => "counter",
        // Label counters never reach the renderer.
        PromType::Gauge | PromType::Label => "gauge",
    }
}

/// Escape a label value per the exposition format.
fn escape(value: &str) -> String {
    if !value.contains(['\\', '"', '\n']) {
        return value.to_string();
    }
    let mut escaped = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}
