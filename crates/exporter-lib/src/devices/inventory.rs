//! Device inventory
//!
//! Queries DCGM for the hardware hierarchy (GPUs with MIG instances and
//! compute instances, NVSwitches with their links, CPUs with their cores),
//! applies the per-class device selections and answers "is this entity
//! monitored" for the planner and collectors.

use super::selection::DeviceSelection;
use crate::dcgm::{
    fields::{DCGM_FI_DEV_NAME, DCGM_MAX_NUM_CPU_CORES},
    DcgmClient, EntityGroup, EntityId, FieldValue,
};
use crate::error::{ExporterError, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One discovered GPU with its MIG children.
#[derive(Debug, Clone)]
pub struct GpuInfo {
    pub gpu_id: u32,
    pub uuid: String,
    pub model: String,
    pub instances: Vec<GpuInstanceInfo>,
}

impl GpuInfo {
    pub fn mig_enabled(&self) -> bool {
        !self.instances.is_empty()
    }
}

/// A MIG GPU instance, optionally with compute-instance children.
#[derive(Debug, Clone)]
pub struct GpuInstanceInfo {
    /// DCGM-global entity id.
    pub entity_id: u32,
    /// Instance id within the parent GPU; what selection minors refer to.
    pub nvml_instance_id: u32,
    pub gpu_id: u32,
    pub profile: String,
    pub compute_instances: Vec<u32>,
}

/// An NVLink under its parent switch.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub link_index: u32,
    pub parent_switch: u32,
    pub is_up: bool,
}

/// An NVSwitch with its links.
#[derive(Debug, Clone)]
pub struct SwitchInfo {
    pub switch_id: u32,
    pub links: Vec<LinkInfo>,
}

/// A CPU with its owned core indices.
#[derive(Debug, Clone)]
pub struct CpuInfo {
    pub cpu_id: u32,
    pub cores: Vec<u32>,
}

/// Per-class selections, parsed from the CLI.
#[derive(Debug, Clone, Default)]
pub struct DeviceOptions {
    pub gpus: DeviceSelection,
    pub switches: DeviceSelection,
    pub cpus: DeviceSelection,
}

/// The discovered fleet plus the selections applied to it.
#[derive(Debug, Clone)]
pub struct Inventory {
    pub gpus: Vec<GpuInfo>,
    pub switches: Vec<SwitchInfo>,
    pub cpus: Vec<CpuInfo>,
    pub options: DeviceOptions,
}

impl Inventory {
    /// Discover the fleet and validate the selections against it.
    pub fn discover(
        dcgm: &Arc<dyn DcgmClient>,
        options: DeviceOptions,
        use_fake_gpus: bool,
    ) -> Result<Self> {
        let gpus = discover_gpus(dcgm, use_fake_gpus)?;
        let switches = discover_switches(dcgm)?;
        let cpus = discover_cpus(dcgm)?;

        info!(
            gpus = gpus.len(),
            mig_instances = gpus.iter().map(|g| g.instances.len()).sum::<usize>(),
            switches = switches.len(),
            cpus = cpus.len(),
            "device inventory built"
        );

        let inventory = Self {
            gpus,
            switches,
            cpus,
            options,
        };
        inventory.validate_selections()?;
        Ok(inventory)
    }

    fn validate_selections(&self) -> Result<()> {
        validate_class(
            &self.options.gpus,
            "GPU",
            &self.gpus.iter().map(|g| g.gpu_id).collect::<Vec<_>>(),
            &self
                .gpus
                .iter()
                .flat_map(|g| g.instances.iter().map(|i| i.nvml_instance_id))
                .collect::<Vec<_>>(),
        )?;
        validate_class(
            &self.options.switches,
            "switch",
            &self.switches.iter().map(|s| s.switch_id).collect::<Vec<_>>(),
            &self
                .switches
                .iter()
                .flat_map(|s| s.links.iter().map(|l| l.link_index))
                .collect::<Vec<_>>(),
        )?;
        validate_class(
            &self.options.cpus,
            "CPU",
            &self.cpus.iter().map(|c| c.cpu_id).collect::<Vec<_>>(),
            &self
                .cpus
                .iter()
                .flat_map(|c| c.cores.iter().copied())
                .collect::<Vec<_>>(),
        )
    }

    /// GPUs monitored as whole devices. Flex decides per GPU: MIG-enabled
    /// GPUs are monitored through their instances instead.
    pub fn monitored_gpus(&self) -> Vec<&GpuInfo> {
        let sel = &self.options.gpus;
        if sel.flex {
            return self.gpus.iter().filter(|g| !g.mig_enabled()).collect();
        }
        if !sel.minor.is_empty() {
            // Explicit minor selection monitors instances, not devices.
            return Vec::new();
        }
        self.gpus.iter().filter(|g| sel.major_selected(g.gpu_id)).collect()
    }

    /// Monitored MIG GPU instances, with their parent GPU.
    pub fn monitored_instances(&self) -> Vec<(&GpuInfo, &GpuInstanceInfo)> {
        let sel = &self.options.gpus;
        let mut out = Vec::new();
        for gpu in &self.gpus {
            for instance in &gpu.instances {
                let watched = if sel.flex {
                    true
                } else if !sel.minor.is_empty() {
                    sel.major_selected(gpu.gpu_id) && sel.minor_selected(instance.nvml_instance_id)
                } else {
                    false
                };
                if watched {
                    out.push((gpu, instance));
                }
            }
        }
        out
    }

    pub fn monitored_switches(&self) -> Vec<&SwitchInfo> {
        let sel = &self.options.switches;
        self.switches
            .iter()
            .filter(|s| sel.flex || (sel.minor.is_empty() && sel.major_selected(s.switch_id)))
            .collect()
    }

    /// Monitored links; the enclosing switch must be monitored and the
    /// link must be up.
    pub fn monitored_links(&self) -> Vec<&LinkInfo> {
        let sel = &self.options.switches;
        let mut out = Vec::new();
        for switch in &self.switches {
            let switch_watched = sel.flex || sel.major_selected(switch.switch_id);
            if !switch_watched {
                continue;
            }
            for link in &switch.links {
                if !link.is_up {
                    continue;
                }
                if sel.flex || sel.minor.is_empty() || sel.minor_selected(link.link_index) {
                    out.push(link);
                }
            }
        }
        out
    }

    pub fn monitored_cpus(&self) -> Vec<&CpuInfo> {
        let sel = &self.options.cpus;
        self.cpus
            .iter()
            .filter(|c| sel.flex || (sel.minor.is_empty() && sel.major_selected(c.cpu_id)))
            .collect()
    }

    /// Monitored cores with their parent CPU id.
    pub fn monitored_cores(&self) -> Vec<(u32, u32)> {
        let sel = &self.options.cpus;
        let mut out = Vec::new();
        for cpu in &self.cpus {
            let cpu_watched = sel.flex || sel.major_selected(cpu.cpu_id);
            if !cpu_watched {
                continue;
            }
            for &core in &cpu.cores {
                if sel.flex || sel.minor.is_empty() || sel.minor_selected(core) {
                    out.push((cpu.cpu_id, core));
                }
            }
        }
        out
    }

    /// GPU by UUID; used by the pod mapper for MIG parent lookups.
    pub fn gpu_by_uuid(&self, uuid: &str) -> Option<&GpuInfo> {
        self.gpus.iter().find(|g| g.uuid == uuid)
    }
}

fn validate_class(
    sel: &DeviceSelection,
    kind: &'static str,
    majors: &[u32],
    minors: &[u32],
) -> Result<()> {
    if sel.flex {
        return Ok(());
    }
    for &id in sel.major.iter().filter(|&&id| id >= 0) {
        if !majors.contains(&(id as u32)) {
            return Err(ExporterError::DeviceNotFound { kind, id });
        }
    }
    for &id in sel.minor.iter().filter(|&&id| id >= 0) {
        if !minors.contains(&(id as u32)) {
            return Err(ExporterError::DeviceNotFound { kind, id });
        }
    }
    Ok(())
}

fn discover_gpus(dcgm: &Arc<dyn DcgmClient>, use_fake_gpus: bool) -> Result<Vec<GpuInfo>> {
    let count = dcgm.get_all_device_count()?;
    let mut gpus = Vec::with_capacity(count as usize);

    for gpu_id in 0..count {
        let info = match dcgm.device_info(gpu_id) {
            Ok(info) if !info.uuid.is_empty() => info,
            Ok(_) | Err(_) if use_fake_gpus => {
                debug!(gpu_id, "synthesising fake GPU");
                crate::dcgm::DeviceInfo {
                    gpu_id,
                    uuid: format!("fake{gpu_id}"),
                    model: "Fake GPU".to_string(),
                }
            }
            Ok(info) => info,
            Err(e) => return Err(e.into()),
        };
        gpus.push(GpuInfo {
            gpu_id: info.gpu_id,
            uuid: info.uuid,
            model: info.model,
            instances: Vec::new(),
        });
    }

    // Attach the MIG hierarchy: GPU instances under GPUs, compute
    // instances under GPU instances.
    for entry in dcgm.gpu_instance_hierarchy()? {
        match (entry.entity.group, entry.parent.group) {
            (EntityGroup::GpuInstance, EntityGroup::Gpu) => {
                if let Some(gpu) = gpus.iter_mut().find(|g| g.gpu_id == entry.parent.id) {
                    gpu.instances.push(GpuInstanceInfo {
                        entity_id: entry.entity.id,
                        nvml_instance_id: entry.info_id,
                        gpu_id: entry.parent.id,
                        profile: String::new(),
                        compute_instances: Vec::new(),
                    });
                }
            }
            (EntityGroup::ComputeInstance, EntityGroup::GpuInstance) => {
                if let Some(instance) = gpus
                    .iter_mut()
                    .flat_map(|g| g.instances.iter_mut())
                    .find(|i| i.entity_id == entry.parent.id)
                {
                    instance.compute_instances.push(entry.entity.id);
                }
            }
            _ => {}
        }
    }

    resolve_mig_profiles(dcgm, &mut gpus)?;
    Ok(gpus)
}

/// Populate `profile` for every instance by a live read of the device-name
/// field. Fails naming the unresolved entity ids.
fn resolve_mig_profiles(dcgm: &Arc<dyn DcgmClient>, gpus: &mut [GpuInfo]) -> Result<()> {
    let entities: Vec<EntityId> = gpus
        .iter()
        .flat_map(|g| {
            g.instances
                .iter()
                .map(|i| EntityId::new(EntityGroup::GpuInstance, i.entity_id))
        })
        .collect();
    if entities.is_empty() {
        return Ok(());
    }

    let samples = dcgm.entities_get_latest_values(&entities, &[DCGM_FI_DEV_NAME], true)?;
    for sample in samples {
        if sample.value.is_blank() {
            continue;
        }
        if let FieldValue::String(name) = &sample.value {
            if let Some(instance) = gpus
                .iter_mut()
                .flat_map(|g| g.instances.iter_mut())
                .find(|i| i.entity_id == sample.entity.id)
            {
                instance.profile = name.clone();
            }
        }
    }

    let unresolved: Vec<u32> = gpus
        .iter()
        .flat_map(|g| g.instances.iter())
        .filter(|i| i.profile.is_empty())
        .map(|i| i.entity_id)
        .collect();
    if unresolved.is_empty() {
        Ok(())
    } else {
        Err(ExporterError::MigProfileMissing(unresolved))
    }
}

fn discover_switches(dcgm: &Arc<dyn DcgmClient>) -> Result<Vec<SwitchInfo>> {
    let switch_ids = dcgm.entity_group_entities(EntityGroup::Switch)?;
    let mut switches: Vec<SwitchInfo> = switch_ids
        .into_iter()
        .map(|switch_id| SwitchInfo {
            switch_id,
            links: Vec::new(),
        })
        .collect();

    for status in dcgm.nvlink_status()? {
        if status.parent.group != EntityGroup::Switch {
            continue;
        }
        match switches.iter_mut().find(|s| s.switch_id == status.parent.id) {
            Some(switch) => switch.links.push(LinkInfo {
                link_index: status.link_index,
                parent_switch: status.parent.id,
                is_up: status.is_up,
            }),
            None => warn!(
                switch_id = status.parent.id,
                link = status.link_index,
                "NVLink reports a parent switch missing from the inventory"
            ),
        }
    }
    Ok(switches)
}

fn discover_cpus(dcgm: &Arc<dyn DcgmClient>) -> Result<Vec<CpuInfo>> {
    Ok(dcgm
        .cpu_hierarchy()?
        .into_iter()
        .map(|entry| CpuInfo {
            cpu_id: entry.cpu_id,
            cores: entry.core_ids(DCGM_MAX_NUM_CPU_CORES),
        })
        .collect())
}
