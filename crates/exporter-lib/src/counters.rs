//! Counter catalogue
//!
//! Loads the operator-supplied counter CSV and splits it into the counters
//! DCGM samples directly and the computed windowed metrics this exporter
//! derives itself. Label-kind counters land in both halves so each collector
//! can copy label values onto its own metrics.

use crate::dcgm::DcgmClient;
use crate::error::{ExporterError, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Metric name of the windowed XID error collector.
pub const XID_ERRORS_COUNT_NAME: &str = "DCGM_EXP_XID_ERRORS_COUNT";
/// Metric name of the windowed clock-event collector.
pub const CLOCK_EVENTS_COUNT_NAME: &str = "DCGM_EXP_CLOCK_EVENTS_COUNT";

/// Prometheus-side type of a counter row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromType {
    Gauge,
    Counter,
    /// Never emitted as a metric; the value becomes a label on every
    /// sibling metric of the same entity.
    Label,
}

impl PromType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromType::Gauge => "gauge",
            PromType::Counter => "counter",
            PromType::Label => "label",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gauge" => Ok(PromType::Gauge),
            "counter" => Ok(PromType::Counter),
            "label" => Ok(PromType::Label),
            other => Err(ExporterError::Config(format!(
                "unsupported counter type '{other}' (expected gauge, counter or label)"
            ))),
        }
    }
}

/// One loaded counter. Identity is `field_id` for DCGM counters; the
/// windowed synthetics carry `field_id = 0` and are identified by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    pub field_id: u16,
    pub field_name: String,
    pub prom_type: PromType,
    pub help: String,
}

/// Which windowed collector a synthetic counter drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowedKind {
    XidErrors,
    ClockEvents,
}

/// A synthetic counter plus the label counters it copies.
#[derive(Debug, Clone)]
pub struct ExporterCounter {
    pub counter: Counter,
    pub kind: WindowedKind,
}

/// Output of catalogue analysis: the counter list split by who computes it.
#[derive(Debug, Clone, Default)]
pub struct CounterSet {
    /// Directly sampled counters, label rows included.
    pub dcgm_counters: Vec<Counter>,
    /// Computed windowed counters.
    pub exporter_counters: Vec<ExporterCounter>,
    /// Label rows, shared by both collector families.
    pub labels: Vec<Counter>,
}

impl CounterSet {
    pub fn is_empty(&self) -> bool {
        self.dcgm_counters.is_empty() && self.exporter_counters.is_empty()
    }
}

/// Parse the three-column counter CSV (`FieldName,PromType,Help`).
/// `#`-prefixed and blank lines are ignored. The help column may itself
/// contain commas.
pub fn parse_counter_csv(contents: &str) -> Result<Vec<(String, String, String)>> {
    let mut rows = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(3, ',');
        let name = parts.next().unwrap_or_default().trim();
        let prom_type = parts.next().map(str::trim).unwrap_or_default();
        let help = parts.next().map(str::trim).unwrap_or_default();
        if name.is_empty() || prom_type.is_empty() {
            return Err(ExporterError::Config(format!(
                "malformed counter row at line {}: '{}'",
                lineno + 1,
                line
            )));
        }
        rows.push((name.to_string(), prom_type.to_string(), help.to_string()));
    }
    Ok(rows)
}

/// Load and analyse a counter file against the DCGM field catalogue.
pub fn load_counter_file(path: &Path, dcgm: &Arc<dyn DcgmClient>) -> Result<CounterSet> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ExporterError::Config(format!("cannot read counter file {}: {e}", path.display()))
    })?;
    let rows = parse_counter_csv(&contents)?;
    analyze_counters(&rows, dcgm)
}

/// Classify counter rows into DCGM-sampled and exporter-computed counters.
///
/// Fails with [`ExporterError::InvalidCounter`] when a row names neither a
/// known DCGM field nor one of the windowed synthetics.
pub fn analyze_counters(
    rows: &[(String, String, String)],
    dcgm: &Arc<dyn DcgmClient>,
) -> Result<CounterSet> {
    let mut set = CounterSet::default();

    for (name, prom_type, help) in rows {
        let prom_type = PromType::parse(prom_type)?;

        match windowed_kind(name) {
            Some(kind) => {
                debug!(counter = %name, "registered windowed exporter counter");
                set.exporter_counters.push(ExporterCounter {
                    counter: Counter {
                        field_id: 0,
                        field_name: name.clone(),
                        prom_type,
                        help: help.clone(),
                    },
                    kind,
                });
            }
            None => {
                let field_id = dcgm
                    .field_id_by_name(name)
                    .ok_or_else(|| ExporterError::InvalidCounter(name.clone()))?;
                let counter = Counter {
                    field_id,
                    field_name: name.clone(),
                    prom_type,
                    help: help.clone(),
                };
                if prom_type == PromType::Label {
                    set.labels.push(counter.clone());
                }
                set.dcgm_counters.push(counter);
            }
        }
    }

    if set.exporter_counters.is_empty() && set.labels.len() == set.dcgm_counters.len() {
        warn!("counter file contains only label rows; nothing will be emitted");
    }

    Ok(set)
}

fn windowed_kind(name: &str) -> Option<WindowedKind> {
    match name {
        XID_ERRORS_COUNT_NAME => Some(WindowedKind::XidErrors),
        CLOCK_EVENTS_COUNT_NAME => Some(WindowedKind::ClockEvents),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcgm::{connect, DcgmOptions, EngineTopology};

    fn client() -> Arc<dyn DcgmClient> {
        connect(&DcgmOptions {
            fake_topology: Some(EngineTopology::fake_gpus(1)),
            ..DcgmOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn csv_parsing_skips_comments_and_keeps_commas_in_help() {
        let rows = parse_counter_csv(
            "# Clocks\nDCGM_FI_DEV_SM_CLOCK, gauge, SM clock, in MHz.\n\nDCGM_FI_DRIVER_VERSION, label, drv\n",
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "DCGM_FI_DEV_SM_CLOCK");
        assert_eq!(rows[0].2, "SM clock, in MHz.");
    }

    #[test]
    fn malformed_row_is_a_config_error() {
        assert!(parse_counter_csv("DCGM_FI_DEV_SM_CLOCK").is_err());
    }

    #[test]
    fn unknown_field_name_is_invalid_counter() {
        let rows = vec![("DCGM_FI_DEV_BOGUS".into(), "gauge".into(), String::new())];
        let err = analyze_counters(&rows, &client()).unwrap_err();
        assert!(matches!(err, ExporterError::InvalidCounter(name) if name == "DCGM_FI_DEV_BOGUS"));
    }

    #[test]
    fn labels_appear_in_both_halves() {
        let rows = vec![
            ("DCGM_FI_DRIVER_VERSION".into(), "label".into(), "drv".into()),
            ("DCGM_FI_DEV_GPU_TEMP".into(), "gauge".into(), "temp".into()),
            (XID_ERRORS_COUNT_NAME.into(), "gauge".into(), "xids".into()),
        ];
        let set = analyze_counters(&rows, &client()).unwrap();
        assert_eq!(set.dcgm_counters.len(), 2);
        assert_eq!(set.exporter_counters.len(), 1);
        assert_eq!(set.labels.len(), 1);
        assert_eq!(set.exporter_counters[0].kind, WindowedKind::XidErrors);
    }

    #[test]
    fn windowed_counters_are_recognised_by_name() {
        let rows = vec![(CLOCK_EVENTS_COUNT_NAME.into(), "gauge".into(), String::new())];
        let set = analyze_counters(&rows, &client()).unwrap();
        assert_eq!(set.exporter_counters[0].kind, WindowedKind::ClockEvents);
        assert!(set.dcgm_counters.is_empty());
    }
}
