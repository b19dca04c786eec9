//! Sampling collector
//!
//! Reads the latest value of every planned field for every monitored entity
//! of one class and turns each non-sentinel sample into a metric record.
//! Label-kind counters never emit; their values are copied onto every
//! sibling metric of the same entity.

use super::{format_value, Collector, CollectorConfig, Metric, Snapshot};
use crate::counters::{Counter, PromType};
use crate::dcgm::{DcgmClient, EntityGroup, EntityId, Sample};
use crate::devices::Inventory;
use crate::error::{ExporterError, Result};
use crate::planner::EntityClass;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Per-class latest-value collector.
pub struct SamplingCollector {
    dcgm: Arc<dyn DcgmClient>,
    inventory: Arc<Inventory>,
    class: EntityClass,
    field_ids: Vec<u16>,
    counters_by_field: HashMap<u16, Counter>,
    config: CollectorConfig,
}

/// How one entity's metrics get their identity labels.
enum Target<'a> {
    Gpu(&'a crate::devices::GpuInfo),
    GpuInstance(&'a crate::devices::GpuInfo, &'a crate::devices::GpuInstanceInfo),
    Switch { entity_id: u32, parent: u32 },
    Cpu { entity_id: u32, parent: u32 },
}

impl SamplingCollector {
    pub fn new(
        dcgm: Arc<dyn DcgmClient>,
        inventory: Arc<Inventory>,
        class: EntityClass,
        field_ids: Vec<u16>,
        counters: &[Counter],
        config: CollectorConfig,
    ) -> Self {
        let counters_by_field = counters
            .iter()
            .filter(|c| field_ids.contains(&c.field_id))
            .map(|c| (c.field_id, c.clone()))
            .collect();
        Self {
            dcgm,
            inventory,
            class,
            field_ids,
            counters_by_field,
            config,
        }
    }

    fn read_entity(&self, entity: EntityId) -> Result<Vec<Sample>> {
        self.dcgm
            .entity_get_latest_values(entity, &self.field_ids)
            .map_err(ExporterError::from)
    }

    fn read_link(&self, link_index: u32, parent_switch: u32) -> Result<Vec<Sample>> {
        self.dcgm
            .link_get_latest_values(link_index, parent_switch, &self.field_ids)
            .map_err(ExporterError::from)
    }

    /// Split one entity's samples into label values and emitted metrics.
    fn emit(&self, snapshot: &mut Snapshot, samples: &[Sample], target: &Target<'_>) {
        let mut labels: BTreeMap<String, String> = BTreeMap::new();
        for sample in samples {
            if sample.value.is_blank() {
                continue;
            }
            if let Some(counter) = self.counters_by_field.get(&sample.field_id) {
                if counter.prom_type == PromType::Label {
                    labels.insert(counter.field_name.clone(), format_value(&sample.value));
                }
            }
        }

        for sample in samples {
            if sample.value.is_blank() {
                continue;
            }
            let Some(counter) = self.counters_by_field.get(&sample.field_id) else {
                continue;
            };
            if counter.prom_type == PromType::Label {
                continue;
            }
            let value = format_value(&sample.value);
            let mut metric = match target {
                Target::Gpu(gpu) => Metric::for_gpu(value, gpu, &self.config),
                Target::GpuInstance(gpu, instance) => {
                    Metric::for_gpu_instance(value, gpu, instance, &self.config)
                }
                Target::Switch { entity_id, parent } => {
                    Metric::for_switch_entity(value, *entity_id, *parent, &self.config)
                }
                Target::Cpu { entity_id, parent } => {
                    Metric::for_cpu_entity(value, *entity_id, *parent, &self.config)
                }
            };
            metric.labels = labels.clone();
            snapshot.push(counter, metric);
        }
    }
}

impl Collector for SamplingCollector {
    fn name(&self) -> &'static str {
        match self.class {
            EntityClass::Gpu => "gpu sampling",
            EntityClass::Switch => "switch sampling",
            EntityClass::Link => "link sampling",
            EntityClass::Cpu => "cpu sampling",
            EntityClass::CpuCore => "cpu core sampling",
        }
    }

    fn get_metrics(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::default();
        match self.class {
            EntityClass::Gpu => {
                for gpu in self.inventory.monitored_gpus() {
                    let samples = self.read_entity(EntityId::new(EntityGroup::Gpu, gpu.gpu_id))?;
                    self.emit(&mut snapshot, &samples, &Target::Gpu(gpu));
                }
                for (gpu, instance) in self.inventory.monitored_instances() {
                    let samples = self
                        .read_entity(EntityId::new(EntityGroup::GpuInstance, instance.entity_id))?;
                    self.emit(&mut snapshot, &samples, &Target::GpuInstance(gpu, instance));
                }
            }
            EntityClass::Switch => {
                for switch in self.inventory.monitored_switches() {
                    let samples =
                        self.read_entity(EntityId::new(EntityGroup::Switch, switch.switch_id))?;
                    self.emit(
                        &mut snapshot,
                        &samples,
                        &Target::Switch {
                            entity_id: switch.switch_id,
                            parent: switch.switch_id,
                        },
                    );
                }
            }
            EntityClass::Link => {
                for link in self.inventory.monitored_links() {
                    let samples = self.read_link(link.link_index, link.parent_switch)?;
                    self.emit(
                        &mut snapshot,
                        &samples,
                        &Target::Switch {
                            entity_id: link.link_index,
                            parent: link.parent_switch,
                        },
                    );
                }
            }
            EntityClass::Cpu => {
                for cpu in self.inventory.monitored_cpus() {
                    let samples = self.read_entity(EntityId::new(EntityGroup::Cpu, cpu.cpu_id))?;
                    self.emit(
                        &mut snapshot,
                        &samples,
                        &Target::Cpu {
                            entity_id: cpu.cpu_id,
                            parent: cpu.cpu_id,
                        },
                    );
                }
            }
            EntityClass::CpuCore => {
                for (cpu_id, core) in self.inventory.monitored_cores() {
                    let samples = self.read_entity(EntityId::new(EntityGroup::CpuCore, core))?;
                    self.emit(
                        &mut snapshot,
                        &samples,
                        &Target::Cpu {
                            entity_id: core,
                            parent: cpu_id,
                        },
                    );
                }
            }
        }
        Ok(snapshot)
    }

    fn cleanup(&self) {
        // Watch handles belong to the planner and outlive scrapes.
    }
}
