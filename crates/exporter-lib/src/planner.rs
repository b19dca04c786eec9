//! Field-group planner
//!
//! For each supported entity class, intersects the loaded counters with the
//! fields applicable to that class, creates the DCGM entity groups and field
//! group, and installs the watch that streams samples at the collect
//! interval. Handles are tracked in a LIFO stack so a mid-planning failure
//! unwinds everything created so far.

use crate::counters::Counter;
use crate::dcgm::{
    fields::{DCGM_FI_DRIVER_VERSION, DCGM_GROUP_MAX_ENTITIES},
    DcgmClient, EntityGroup, EntityId, FieldGroupHandle, FieldScope, GroupHandle,
};
use crate::devices::Inventory;
use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Entity classes the planner supports watching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityClass {
    Gpu,
    Switch,
    Link,
    Cpu,
    CpuCore,
}

impl EntityClass {
    pub const ALL: [EntityClass; 5] = [
        EntityClass::Gpu,
        EntityClass::Switch,
        EntityClass::Link,
        EntityClass::Cpu,
        EntityClass::CpuCore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityClass::Gpu => "gpu",
            EntityClass::Switch => "switch",
            EntityClass::Link => "link",
            EntityClass::Cpu => "cpu",
            EntityClass::CpuCore => "cpu_core",
        }
    }

    /// Field scopes this class absorbs. GPU watches also carry instance,
    /// compute-instance and vGPU fields; CPU absorbs core fields. Scope
    /// `None` is a wildcard everywhere.
    fn absorbed_scopes(&self) -> &'static [FieldScope] {
        match self {
            EntityClass::Gpu => &[
                FieldScope::Gpu,
                FieldScope::GpuInstance,
                FieldScope::ComputeInstance,
                FieldScope::Vgpu,
                FieldScope::None,
            ],
            EntityClass::Switch => &[FieldScope::Switch, FieldScope::None],
            EntityClass::Link => &[FieldScope::Link, FieldScope::None],
            EntityClass::Cpu => &[FieldScope::Cpu, FieldScope::CpuCore, FieldScope::None],
            EntityClass::CpuCore => &[FieldScope::CpuCore, FieldScope::None],
        }
    }
}

// Field-group names must be unique process-wide; overlapping scrapes and
// the windowed collectors all draw from this sequence.
static FIELD_GROUP_SEQ: AtomicU64 = AtomicU64::new(1);

/// A unique DCGM field-group name with the given prefix.
pub fn unique_field_group_name(prefix: &str) -> String {
    let seq = FIELD_GROUP_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{seq}")
}

/// One class's live watch: its applicable fields and DCGM handles.
#[derive(Debug)]
pub struct ClassPlan {
    pub class: EntityClass,
    pub field_ids: Vec<u16>,
    pub groups: Vec<GroupHandle>,
    pub field_group: FieldGroupHandle,
}

/// Everything the planner created, unwound LIFO on drop of the run.
pub struct WatchPlan {
    pub classes: Vec<ClassPlan>,
    cleanups: Vec<Cleanup>,
}

enum Cleanup {
    Group(GroupHandle),
    FieldGroup(FieldGroupHandle),
}

impl WatchPlan {
    /// Plan watches for every supported entity class. Classes with no
    /// entities or no applicable fields are logged and excluded.
    pub fn create(
        dcgm: &Arc<dyn DcgmClient>,
        inventory: &Inventory,
        counters: &[Counter],
        collect_interval_ms: u64,
    ) -> Result<Self> {
        let mut plan = WatchPlan {
            classes: Vec::new(),
            cleanups: Vec::new(),
        };

        for class in EntityClass::ALL {
            match plan.plan_class(dcgm, inventory, counters, class, collect_interval_ms) {
                Ok(true) => {}
                Ok(false) => info!(class = class.as_str(), "not collecting; class excluded from scrapes"),
                Err(e) => {
                    // Unwind every handle created so far before failing.
                    plan.cleanup(dcgm);
                    return Err(e);
                }
            }
        }
        Ok(plan)
    }

    fn plan_class(
        &mut self,
        dcgm: &Arc<dyn DcgmClient>,
        inventory: &Inventory,
        counters: &[Counter],
        class: EntityClass,
        collect_interval_ms: u64,
    ) -> Result<bool> {
        let field_ids = applicable_fields(dcgm, counters, class);
        if field_ids.is_empty() {
            return Ok(false);
        }
        // A watch holding nothing but the driver-version label would sample
        // nothing useful.
        if field_ids == [DCGM_FI_DRIVER_VERSION] {
            warn!(
                class = class.as_str(),
                "only DCGM_FI_DRIVER_VERSION applies; skipping watch"
            );
            return Ok(false);
        }

        let groups = self.create_groups(dcgm, inventory, class)?;
        if groups.is_empty() {
            return Ok(false);
        }

        let name = unique_field_group_name(&format!("dcgm_exporter_{}", class.as_str()));
        let field_group = dcgm.field_group_create(&name, &field_ids)?;
        self.cleanups.push(Cleanup::FieldGroup(field_group));

        // Same-scrape semantics: keep exactly the newest sample. The
        // windowed collectors install their own deeper watches.
        for &group in &groups {
            dcgm.watch_fields_with_group(
                field_group,
                group,
                collect_interval_ms as i64 * 1000,
                0.0,
                1,
            )?;
        }

        info!(
            class = class.as_str(),
            fields = field_ids.len(),
            groups = groups.len(),
            "watch installed"
        );
        self.classes.push(ClassPlan {
            class,
            field_ids,
            groups,
            field_group,
        });
        Ok(true)
    }

    fn create_groups(
        &mut self,
        dcgm: &Arc<dyn DcgmClient>,
        inventory: &Inventory,
        class: EntityClass,
    ) -> Result<Vec<GroupHandle>> {
        let mut groups = Vec::new();
        match class {
            EntityClass::Gpu => {
                let gpus = inventory.monitored_gpus();
                let instances = inventory.monitored_instances();
                if gpus.is_empty() && instances.is_empty() {
                    return Ok(groups);
                }
                let group = self.new_group(dcgm, "gpus")?;
                for gpu in gpus {
                    dcgm.add_entity_to_group(group, EntityId::new(EntityGroup::Gpu, gpu.gpu_id))?;
                }
                for (_, instance) in instances {
                    dcgm.add_entity_to_group(
                        group,
                        EntityId::new(EntityGroup::GpuInstance, instance.entity_id),
                    )?;
                }
                groups.push(group);
            }
            EntityClass::Switch => {
                let switches = inventory.monitored_switches();
                if switches.is_empty() {
                    return Ok(groups);
                }
                let group = self.new_group(dcgm, "switches")?;
                for switch in switches {
                    dcgm.add_entity_to_group(
                        group,
                        EntityId::new(EntityGroup::Switch, switch.switch_id),
                    )?;
                }
                groups.push(group);
            }
            EntityClass::Link => {
                // Links are grouped per parent switch and added by
                // (linkIndex, parentSwitch).
                for switch in inventory.monitored_switches() {
                    let links: Vec<_> = inventory
                        .monitored_links()
                        .into_iter()
                        .filter(|l| l.parent_switch == switch.switch_id)
                        .cloned()
                        .collect();
                    if links.is_empty() {
                        continue;
                    }
                    let group = self.new_group(dcgm, "links")?;
                    for link in links {
                        dcgm.add_link_entity_to_group(group, link.link_index, link.parent_switch)?;
                    }
                    groups.push(group);
                }
            }
            EntityClass::Cpu => {
                let cpus = inventory.monitored_cpus();
                if cpus.is_empty() {
                    return Ok(groups);
                }
                let group = self.new_group(dcgm, "cpus")?;
                for cpu in cpus {
                    dcgm.add_entity_to_group(group, EntityId::new(EntityGroup::Cpu, cpu.cpu_id))?;
                }
                groups.push(group);
            }
            EntityClass::CpuCore => {
                // One group per CPU, split at the DCGM per-group cap.
                for cpu in inventory.monitored_cpus() {
                    let cores: Vec<u32> = inventory
                        .monitored_cores()
                        .into_iter()
                        .filter(|(cpu_id, _)| *cpu_id == cpu.cpu_id)
                        .map(|(_, core)| core)
                        .collect();
                    for chunk in cores.chunks(DCGM_GROUP_MAX_ENTITIES) {
                        let group = self.new_group(dcgm, "cpu_cores")?;
                        for &core in chunk {
                            dcgm.add_entity_to_group(
                                group,
                                EntityId::new(EntityGroup::CpuCore, core),
                            )?;
                        }
                        groups.push(group);
                    }
                }
            }
        }
        Ok(groups)
    }

    fn new_group(&mut self, dcgm: &Arc<dyn DcgmClient>, label: &str) -> Result<GroupHandle> {
        let name = unique_field_group_name(&format!("dcgm_exporter_group_{label}"));
        let group = dcgm.create_group(&name)?;
        self.cleanups.push(Cleanup::Group(group));
        Ok(group)
    }

    /// Plan for one class, if it survived planning.
    pub fn class(&self, class: EntityClass) -> Option<&ClassPlan> {
        self.classes.iter().find(|p| p.class == class)
    }

    /// Destroy every created handle in reverse creation order.
    pub fn cleanup(&mut self, dcgm: &Arc<dyn DcgmClient>) {
        while let Some(cleanup) = self.cleanups.pop() {
            let result = match cleanup {
                Cleanup::FieldGroup(fg) => dcgm.field_group_destroy(fg),
                Cleanup::Group(g) => dcgm.destroy_group(g),
            };
            if let Err(e) = result {
                warn!(error = %e, "cleanup of DCGM handle failed");
            }
        }
        self.classes.clear();
    }
}

/// Counter fields whose declared scope the class absorbs, deduplicated,
/// in counter-file order.
fn applicable_fields(dcgm: &Arc<dyn DcgmClient>, counters: &[Counter], class: EntityClass) -> Vec<u16> {
    let scopes = class.absorbed_scopes();
    let mut out: Vec<u16> = Vec::new();
    for counter in counters {
        let Ok(meta) = dcgm.field_meta(counter.field_id) else {
            continue;
        };
        if scopes.contains(&meta.scope) && !out.contains(&counter.field_id) {
            out.push(counter.field_id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::{analyze_counters, CounterSet};
    use crate::dcgm::{CpuHierarchyEntry, EmbeddedEngine, EngineTopology, SimSwitch};
    use crate::devices::DeviceOptions;

    fn fixture(topology: EngineTopology) -> (Arc<EmbeddedEngine>, Arc<dyn DcgmClient>) {
        let engine = Arc::new(EmbeddedEngine::with_topology(topology).synthesizing());
        let client: Arc<dyn DcgmClient> = engine.clone();
        (engine, client)
    }

    fn counters(client: &Arc<dyn DcgmClient>, rows: &[(&str, &str)]) -> CounterSet {
        let rows: Vec<_> = rows
            .iter()
            .map(|(n, t)| (n.to_string(), t.to_string(), String::new()))
            .collect();
        analyze_counters(&rows, client).unwrap()
    }

    #[test]
    fn gpu_class_absorbs_vgpu_fields() {
        let (_, client) = fixture(EngineTopology::fake_gpus(1));
        let set = counters(
            &client,
            &[
                ("DCGM_FI_DEV_GPU_TEMP", "gauge"),
                ("DCGM_FI_DEV_VGPU_LICENSE_STATUS", "gauge"),
                ("DCGM_FI_DEV_NVSWITCH_TEMPERATURE_CURRENT", "gauge"),
            ],
        );
        let fields = applicable_fields(&client, &set.dcgm_counters, EntityClass::Gpu);
        assert_eq!(fields.len(), 2);
        let fields = applicable_fields(&client, &set.dcgm_counters, EntityClass::Switch);
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn driver_version_alone_skips_the_class() {
        let (engine, client) = fixture(EngineTopology::fake_gpus(1));
        let set = counters(&client, &[("DCGM_FI_DRIVER_VERSION", "label")]);
        let plan = WatchPlan::create(&client, &inventory(&client), &set.dcgm_counters, 30000).unwrap();
        assert!(plan.classes.is_empty());
        assert_eq!(engine.field_group_count(), 0);
    }

    fn inventory(client: &Arc<dyn DcgmClient>) -> Inventory {
        Inventory::discover(client, DeviceOptions::default(), false).unwrap()
    }

    #[test]
    fn planning_creates_and_cleanup_destroys_handles() {
        let mut topology = EngineTopology::fake_gpus(2);
        topology.switches.push(SimSwitch {
            switch_id: 0,
            links: vec![(0, true)],
        });
        let (engine, client) = fixture(topology);
        let set = counters(
            &client,
            &[
                ("DCGM_FI_DEV_GPU_TEMP", "gauge"),
                ("DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_TX", "counter"),
            ],
        );
        let mut plan =
            WatchPlan::create(&client, &inventory(&client), &set.dcgm_counters, 30000).unwrap();
        // GPU and link classes plan; the switch class has no applicable
        // fields and is skipped.
        assert!(plan.class(EntityClass::Gpu).is_some());
        assert!(plan.class(EntityClass::Switch).is_none());
        assert!(plan.class(EntityClass::Link).is_some());
        assert!(engine.group_count() > 0);

        plan.cleanup(&client);
        assert_eq!(engine.group_count(), 0);
        assert_eq!(engine.field_group_count(), 0);
    }

    #[test]
    fn cpu_cores_are_chunked_per_group_cap() {
        let mut topology = EngineTopology::fake_gpus(0);
        topology.cpus.push(CpuHierarchyEntry {
            cpu_id: 0,
            owned_cores: vec![u64::MAX, u64::MAX, 0b1111],
        });
        let (_, client) = fixture(topology);
        let set = counters(&client, &[("DCGM_FI_DEV_CPU_UTIL_TOTAL", "gauge")]);
        let plan =
            WatchPlan::create(&client, &inventory(&client), &set.dcgm_counters, 30000).unwrap();
        let cores = plan.class(EntityClass::CpuCore).unwrap();
        // 132 cores split into 64 + 64 + 4.
        assert_eq!(cores.groups.len(), 3);
    }

    #[test]
    fn unique_names_are_monotonic() {
        let a = unique_field_group_name("t");
        let b = unique_field_group_name("t");
        assert_ne!(a, b);
    }
}
