//! In-process DCGM engine
//!
//! Implements the full [`DcgmClient`](super::DcgmClient) contract against an
//! in-memory topology and sample store. It backs `--fake-gpus` runs and
//! every test in this crate: tests build a topology, push samples and drive
//! the pipeline exactly as a hostengine would.

use super::client::DcgmClient;
use super::fields::{self, DCGM_GROUP_MAX_ENTITIES};
use super::types::{
    CpuHierarchyEntry, DcgmError, DeviceInfo, EntityGroup, EntityId, FieldGroupHandle, FieldMeta,
    FieldType, FieldValue, GroupHandle, HierarchyEntry, NvLinkStatus, Sample,
};
use std::collections::HashMap;
use std::sync::Mutex;

/// One simulated MIG GPU instance with its compute instances.
#[derive(Debug, Clone)]
pub struct SimMigInstance {
    /// DCGM-global entity id of the GPU instance.
    pub entity_id: u32,
    /// NVML-scoped instance id within the parent GPU.
    pub nvml_instance_id: u32,
    pub profile: String,
    /// DCGM-global entity ids of child compute instances.
    pub compute_instances: Vec<u32>,
}

/// One simulated GPU.
#[derive(Debug, Clone)]
pub struct SimGpu {
    pub info: DeviceInfo,
    pub mig_instances: Vec<SimMigInstance>,
}

/// One simulated NVSwitch with its links.
#[derive(Debug, Clone)]
pub struct SimSwitch {
    pub switch_id: u32,
    /// (link index, link is up)
    pub links: Vec<(u32, bool)>,
}

/// Topology the engine exposes through discovery calls.
#[derive(Debug, Clone, Default)]
pub struct EngineTopology {
    pub gpus: Vec<SimGpu>,
    pub switches: Vec<SimSwitch>,
    pub cpus: Vec<CpuHierarchyEntry>,
}

impl EngineTopology {
    /// `count` plain GPUs with deterministic UUIDs, no MIG.
    pub fn fake_gpus(count: u32) -> Self {
        let gpus = (0..count)
            .map(|i| SimGpu {
                info: DeviceInfo {
                    gpu_id: i,
                    uuid: format!("GPU-00000000-0000-0000-0000-{i:012}"),
                    model: "NVIDIA H100 80GB HBM3".to_string(),
                },
                mig_instances: Vec::new(),
            })
            .collect();
        Self {
            gpus,
            switches: Vec::new(),
            cpus: Vec::new(),
        }
    }

    fn gpu(&self, gpu_id: u32) -> Option<&SimGpu> {
        self.gpus.iter().find(|g| g.info.gpu_id == gpu_id)
    }

    fn mig_instance(&self, entity_id: u32) -> Option<(&SimGpu, &SimMigInstance)> {
        self.gpus.iter().find_map(|g| {
            g.mig_instances
                .iter()
                .find(|m| m.entity_id == entity_id)
                .map(|m| (g, m))
        })
    }

    fn entity_exists(&self, entity: EntityId) -> bool {
        match entity.group {
            EntityGroup::Gpu => self.gpu(entity.id).is_some(),
            EntityGroup::GpuInstance => self.mig_instance(entity.id).is_some(),
            EntityGroup::ComputeInstance => self
                .gpus
                .iter()
                .flat_map(|g| &g.mig_instances)
                .any(|m| m.compute_instances.contains(&entity.id)),
            EntityGroup::Switch => self.switches.iter().any(|s| s.switch_id == entity.id),
            EntityGroup::Link => true,
            EntityGroup::Cpu => self.cpus.iter().any(|c| c.cpu_id == entity.id),
            EntityGroup::CpuCore => true,
            EntityGroup::Vgpu => false,
        }
    }
}

#[derive(Debug)]
enum GroupMember {
    Entity(EntityId),
    Link { link_index: u32, parent_switch: u32 },
}

#[derive(Debug, Default)]
struct GroupState {
    members: Vec<GroupMember>,
}

#[derive(Debug)]
struct FieldGroupState {
    name: String,
    field_ids: Vec<u16>,
}

#[derive(Debug)]
#[allow(dead_code)]
struct WatchState {
    group: GroupHandle,
    field_group: FieldGroupHandle,
    update_freq_us: i64,
    max_keep_age_secs: f64,
    max_keep_samples: i32,
}

#[derive(Default)]
struct EngineState {
    topology: EngineTopology,
    groups: HashMap<u64, GroupState>,
    field_groups: HashMap<u64, FieldGroupState>,
    watches: Vec<WatchState>,
    samples: HashMap<(EntityId, u16), Vec<Sample>>,
    next_handle: u64,
    synthesize: bool,
    connected: bool,
}

/// In-memory DCGM engine.
pub struct EmbeddedEngine {
    state: Mutex<EngineState>,
}

/// Microseconds since the unix epoch.
pub fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Encoded sample-store key for a link: links are addressed by
/// `(linkIndex, parentSwitch)` rather than a flat id.
fn link_entity(link_index: u32, parent_switch: u32) -> EntityId {
    EntityId::new(EntityGroup::Link, (parent_switch << 16) | link_index)
}

impl EmbeddedEngine {
    pub fn with_topology(topology: EngineTopology) -> Self {
        Self {
            state: Mutex::new(EngineState {
                topology,
                connected: true,
                ..Default::default()
            }),
        }
    }

    /// Engine with nothing to discover; the inventory layer reports each
    /// entity class as unavailable.
    pub fn discovering() -> Self {
        Self::with_topology(EngineTopology::default())
    }

    /// Fabricate plausible readings for fields with no stored sample.
    pub fn synthesizing(self) -> Self {
        self.state.lock().unwrap().synthesize = true;
        self
    }

    /// Store a sample for later latest-value or values-since reads.
    pub fn push_sample(&self, entity: EntityId, field_id: u16, value: FieldValue, timestamp_us: i64) {
        self.push_sample_with_status(entity, field_id, value, timestamp_us, 0);
    }

    pub fn push_sample_with_status(
        &self,
        entity: EntityId,
        field_id: u16,
        value: FieldValue,
        timestamp_us: i64,
        status: i32,
    ) {
        let mut state = self.state.lock().unwrap();
        state.samples.entry((entity, field_id)).or_default().push(Sample {
            entity,
            field_id,
            timestamp_us,
            status,
            value,
        });
    }

    /// Store a sample for a link, keyed the way link reads address it.
    pub fn push_link_sample(
        &self,
        link_index: u32,
        parent_switch: u32,
        field_id: u16,
        value: FieldValue,
        timestamp_us: i64,
    ) {
        self.push_sample(link_entity(link_index, parent_switch), field_id, value, timestamp_us);
    }

    /// Simulate losing the hostengine connection; every later call fails
    /// with [`DcgmError::ConnectionLost`].
    pub fn kill_connection(&self) {
        self.state.lock().unwrap().connected = false;
    }

    /// Number of live field groups; used to assert cleanup behaviour.
    pub fn field_group_count(&self) -> usize {
        self.state.lock().unwrap().field_groups.len()
    }

    /// Number of live entity groups.
    pub fn group_count(&self) -> usize {
        self.state.lock().unwrap().groups.len()
    }

    fn synthesize_value(state: &EngineState, entity: EntityId, meta: &FieldMeta) -> FieldValue {
        match meta.field_type {
            FieldType::Int64 => {
                FieldValue::Int64(25 + (meta.field_id as i64 * 31 + entity.id as i64 * 7) % 50)
            }
            FieldType::Double => {
                FieldValue::Double(((meta.field_id as f64) * 0.31 + entity.id as f64) % 100.0)
            }
            FieldType::String => {
                if meta.field_id == fields::DCGM_FI_DRIVER_VERSION {
                    FieldValue::String("535.129.03".to_string())
                } else if meta.field_id == fields::DCGM_FI_DEV_NAME {
                    match entity.group {
                        EntityGroup::GpuInstance => FieldValue::String(
                            state
                                .topology
                                .mig_instance(entity.id)
                                .map(|(_, m)| m.profile.clone())
                                .unwrap_or_default(),
                        ),
                        _ => FieldValue::String(
                            state
                                .topology
                                .gpu(entity.id)
                                .map(|g| g.info.model.clone())
                                .unwrap_or_default(),
                        ),
                    }
                } else {
                    FieldValue::String(String::new())
                }
            }
            FieldType::Binary => FieldValue::Binary(Vec::new()),
        }
    }

    fn latest_value(state: &EngineState, entity: EntityId, field_id: u16) -> Result<Sample, DcgmError> {
        if let Some(stored) = state.samples.get(&(entity, field_id)).and_then(|v| v.last()) {
            return Ok(stored.clone());
        }
        let meta = fields::field_by_id(field_id).ok_or(DcgmError::UnknownField(field_id))?;
        let value = if state.synthesize {
            Self::synthesize_value(state, entity, meta)
        } else {
            // No data: report the typed blank sentinel, as the native
            // library does for unwatched or unpopulated fields.
            match meta.field_type {
                FieldType::Int64 => FieldValue::Int64(super::types::INT64_BLANK),
                FieldType::Double => FieldValue::Double(super::types::FP64_BLANK),
                FieldType::String => FieldValue::String(super::types::STR_BLANK.to_string()),
                FieldType::Binary => FieldValue::Binary(Vec::new()),
            }
        };
        Ok(Sample {
            entity,
            field_id,
            timestamp_us: now_us(),
            status: 0,
            value,
        })
    }

    fn check_connected(state: &EngineState) -> Result<(), DcgmError> {
        if state.connected {
            Ok(())
        } else {
            Err(DcgmError::ConnectionLost)
        }
    }
}

impl DcgmClient for EmbeddedEngine {
    fn create_group(&self, _name: &str) -> Result<GroupHandle, DcgmError> {
        let mut state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        state.next_handle += 1;
        let handle = GroupHandle(state.next_handle);
        state.groups.insert(handle.0, GroupState::default());
        Ok(handle)
    }

    fn destroy_group(&self, group: GroupHandle) -> Result<(), DcgmError> {
        let mut state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        state
            .groups
            .remove(&group.0)
            .map(|_| ())
            .ok_or(DcgmError::UnknownGroup(group))
    }

    fn add_entity_to_group(&self, group: GroupHandle, entity: EntityId) -> Result<(), DcgmError> {
        let mut state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        if !state.topology.entity_exists(entity) {
            return Err(DcgmError::UnknownEntity(entity));
        }
        let group_state = state.groups.get_mut(&group.0).ok_or(DcgmError::UnknownGroup(group))?;
        if group_state.members.len() >= DCGM_GROUP_MAX_ENTITIES {
            return Err(DcgmError::Api(format!(
                "group is full ({DCGM_GROUP_MAX_ENTITIES} entities)"
            )));
        }
        group_state.members.push(GroupMember::Entity(entity));
        Ok(())
    }

    fn add_link_entity_to_group(
        &self,
        group: GroupHandle,
        link_index: u32,
        parent_switch: u32,
    ) -> Result<(), DcgmError> {
        let mut state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        let group_state = state.groups.get_mut(&group.0).ok_or(DcgmError::UnknownGroup(group))?;
        if group_state.members.len() >= DCGM_GROUP_MAX_ENTITIES {
            return Err(DcgmError::Api(format!(
                "group is full ({DCGM_GROUP_MAX_ENTITIES} entities)"
            )));
        }
        group_state.members.push(GroupMember::Link {
            link_index,
            parent_switch,
        });
        Ok(())
    }

    fn field_group_create(
        &self,
        name: &str,
        field_ids: &[u16],
    ) -> Result<FieldGroupHandle, DcgmError> {
        let mut state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        if state.field_groups.values().any(|fg| fg.name == name) {
            return Err(DcgmError::Api(format!("duplicate field group name '{name}'")));
        }
        state.next_handle += 1;
        let handle = FieldGroupHandle(state.next_handle);
        state.field_groups.insert(
            handle.0,
            FieldGroupState {
                name: name.to_string(),
                field_ids: field_ids.to_vec(),
            },
        );
        Ok(handle)
    }

    fn field_group_destroy(&self, field_group: FieldGroupHandle) -> Result<(), DcgmError> {
        let mut state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        state
            .field_groups
            .remove(&field_group.0)
            .map(|_| ())
            .ok_or(DcgmError::UnknownFieldGroup(field_group))
    }

    fn watch_fields_with_group(
        &self,
        field_group: FieldGroupHandle,
        group: GroupHandle,
        update_freq_us: i64,
        max_keep_age_secs: f64,
        max_keep_samples: i32,
    ) -> Result<(), DcgmError> {
        let mut state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        if !state.groups.contains_key(&group.0) {
            return Err(DcgmError::UnknownGroup(group));
        }
        if !state.field_groups.contains_key(&field_group.0) {
            return Err(DcgmError::UnknownFieldGroup(field_group));
        }
        state.watches.push(WatchState {
            group,
            field_group,
            update_freq_us,
            max_keep_age_secs,
            max_keep_samples,
        });
        Ok(())
    }

    fn update_all_fields(&self, _wait_for_update: bool) -> Result<(), DcgmError> {
        let state = self.state.lock().unwrap();
        Self::check_connected(&state)
    }

    fn entity_get_latest_values(
        &self,
        entity: EntityId,
        field_ids: &[u16],
    ) -> Result<Vec<Sample>, DcgmError> {
        let state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        field_ids
            .iter()
            .map(|&f| Self::latest_value(&state, entity, f))
            .collect()
    }

    fn link_get_latest_values(
        &self,
        link_index: u32,
        parent_switch: u32,
        field_ids: &[u16],
    ) -> Result<Vec<Sample>, DcgmError> {
        self.entity_get_latest_values(link_entity(link_index, parent_switch), field_ids)
    }

    fn entities_get_latest_values(
        &self,
        entities: &[EntityId],
        field_ids: &[u16],
        _live: bool,
    ) -> Result<Vec<Sample>, DcgmError> {
        let state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        let mut out = Vec::with_capacity(entities.len() * field_ids.len());
        for &entity in entities {
            for &field_id in field_ids {
                out.push(Self::latest_value(&state, entity, field_id)?);
            }
        }
        Ok(out)
    }

    fn get_values_since(
        &self,
        group: GroupHandle,
        field_group: FieldGroupHandle,
        since_us: i64,
    ) -> Result<(Vec<Sample>, i64), DcgmError> {
        let state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        let group_state = state.groups.get(&group.0).ok_or(DcgmError::UnknownGroup(group))?;
        let fg = state
            .field_groups
            .get(&field_group.0)
            .ok_or(DcgmError::UnknownFieldGroup(field_group))?;

        let mut out = Vec::new();
        for member in &group_state.members {
            let entity = match member {
                GroupMember::Entity(e) => *e,
                GroupMember::Link {
                    link_index,
                    parent_switch,
                } => link_entity(*link_index, *parent_switch),
            };
            for &field_id in &fg.field_ids {
                if let Some(stored) = state.samples.get(&(entity, field_id)) {
                    out.extend(stored.iter().filter(|s| s.timestamp_us >= since_us).cloned());
                }
            }
        }
        out.sort_by_key(|s| s.timestamp_us);
        let next = out.last().map(|s| s.timestamp_us + 1).unwrap_or_else(now_us);
        Ok((out, next))
    }

    fn get_all_device_count(&self) -> Result<u32, DcgmError> {
        let state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        Ok(state.topology.gpus.len() as u32)
    }

    fn device_info(&self, gpu_id: u32) -> Result<DeviceInfo, DcgmError> {
        let state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        state
            .topology
            .gpu(gpu_id)
            .map(|g| g.info.clone())
            .ok_or(DcgmError::UnknownEntity(EntityId::new(EntityGroup::Gpu, gpu_id)))
    }

    fn gpu_instance_hierarchy(&self) -> Result<Vec<HierarchyEntry>, DcgmError> {
        let state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        let mut out = Vec::new();
        for gpu in &state.topology.gpus {
            for mig in &gpu.mig_instances {
                out.push(HierarchyEntry {
                    entity: EntityId::new(EntityGroup::GpuInstance, mig.entity_id),
                    parent: EntityId::new(EntityGroup::Gpu, gpu.info.gpu_id),
                    info_id: mig.nvml_instance_id,
                });
                for &ci in &mig.compute_instances {
                    out.push(HierarchyEntry {
                        entity: EntityId::new(EntityGroup::ComputeInstance, ci),
                        parent: EntityId::new(EntityGroup::GpuInstance, mig.entity_id),
                        info_id: ci,
                    });
                }
            }
        }
        Ok(out)
    }

    fn cpu_hierarchy(&self) -> Result<Vec<CpuHierarchyEntry>, DcgmError> {
        let state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        Ok(state.topology.cpus.clone())
    }

    fn nvlink_status(&self) -> Result<Vec<NvLinkStatus>, DcgmError> {
        let state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        let mut out = Vec::new();
        for switch in &state.topology.switches {
            for &(link_index, is_up) in &switch.links {
                out.push(NvLinkStatus {
                    parent: EntityId::new(EntityGroup::Switch, switch.switch_id),
                    link_index,
                    is_up,
                });
            }
        }
        Ok(out)
    }

    fn entity_group_entities(&self, group: EntityGroup) -> Result<Vec<u32>, DcgmError> {
        let state = self.state.lock().unwrap();
        Self::check_connected(&state)?;
        let ids = match group {
            EntityGroup::Gpu => state.topology.gpus.iter().map(|g| g.info.gpu_id).collect(),
            EntityGroup::Switch => state.topology.switches.iter().map(|s| s.switch_id).collect(),
            EntityGroup::Cpu => state.topology.cpus.iter().map(|c| c.cpu_id).collect(),
            EntityGroup::GpuInstance => state
                .topology
                .gpus
                .iter()
                .flat_map(|g| g.mig_instances.iter().map(|m| m.entity_id))
                .collect(),
            _ => Vec::new(),
        };
        Ok(ids)
    }

    fn field_meta(&self, field_id: u16) -> Result<FieldMeta, DcgmError> {
        fields::field_by_id(field_id)
            .cloned()
            .ok_or(DcgmError::UnknownField(field_id))
    }

    fn field_id_by_name(&self, name: &str) -> Option<u16> {
        fields::field_by_name(name).map(|f| f.field_id)
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.groups.clear();
        state.field_groups.clear();
        state.watches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcgm::fields::DCGM_FI_DEV_GPU_TEMP;

    #[test]
    fn unwatched_field_reads_blank() {
        let engine = EmbeddedEngine::with_topology(EngineTopology::fake_gpus(1));
        let gpu = EntityId::new(EntityGroup::Gpu, 0);
        let samples = engine.entity_get_latest_values(gpu, &[DCGM_FI_DEV_GPU_TEMP]).unwrap();
        assert!(samples[0].value.is_blank());
    }

    #[test]
    fn pushed_sample_wins_over_synthesis() {
        let engine = EmbeddedEngine::with_topology(EngineTopology::fake_gpus(1)).synthesizing();
        let gpu = EntityId::new(EntityGroup::Gpu, 0);
        engine.push_sample(gpu, DCGM_FI_DEV_GPU_TEMP, FieldValue::Int64(42), now_us());
        let samples = engine.entity_get_latest_values(gpu, &[DCGM_FI_DEV_GPU_TEMP]).unwrap();
        assert_eq!(samples[0].value, FieldValue::Int64(42));
    }

    #[test]
    fn duplicate_field_group_names_rejected() {
        let engine = EmbeddedEngine::with_topology(EngineTopology::fake_gpus(1));
        engine.field_group_create("fg1", &[DCGM_FI_DEV_GPU_TEMP]).unwrap();
        assert!(engine.field_group_create("fg1", &[DCGM_FI_DEV_GPU_TEMP]).is_err());
    }

    #[test]
    fn values_since_filters_by_timestamp() {
        let engine = EmbeddedEngine::with_topology(EngineTopology::fake_gpus(1));
        let gpu = EntityId::new(EntityGroup::Gpu, 0);
        let group = engine.create_group("g").unwrap();
        engine.add_entity_to_group(group, gpu).unwrap();
        let fg = engine.field_group_create("fg", &[DCGM_FI_DEV_GPU_TEMP]).unwrap();

        engine.push_sample(gpu, DCGM_FI_DEV_GPU_TEMP, FieldValue::Int64(1), 1_000);
        engine.push_sample(gpu, DCGM_FI_DEV_GPU_TEMP, FieldValue::Int64(2), 2_000);
        engine.push_sample(gpu, DCGM_FI_DEV_GPU_TEMP, FieldValue::Int64(3), 3_000);

        let (samples, next) = engine.get_values_since(group, fg, 2_000).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(next, 3_001);
    }

    #[test]
    fn killed_connection_fails_every_call() {
        let engine = EmbeddedEngine::with_topology(EngineTopology::fake_gpus(1));
        engine.kill_connection();
        let err = engine.get_all_device_count().unwrap_err();
        assert!(matches!(err, DcgmError::ConnectionLost));
    }

    #[test]
    fn group_capacity_is_enforced() {
        let engine = EmbeddedEngine::with_topology(EngineTopology::fake_gpus(1));
        let group = engine.create_group("links").unwrap();
        for i in 0..DCGM_GROUP_MAX_ENTITIES {
            engine.add_link_entity_to_group(group, i as u32, 0).unwrap();
        }
        assert!(engine.add_link_entity_to_group(group, 64, 0).is_err());
    }
}
