//! DCGM collaborator interface
//!
//! The native library is an external collaborator; this trait is the exact
//! operation set the pipeline invokes against it. All calls block the
//! calling thread, mirroring the native API. `connect` hands back the
//! embedded engine; an FFI-backed client slots in behind the same trait.

use super::engine::{EmbeddedEngine, EngineTopology};
use super::types::{
    CpuHierarchyEntry, DcgmError, DeviceInfo, EntityGroup, EntityId, FieldGroupHandle, FieldMeta,
    GroupHandle, HierarchyEntry, NvLinkStatus, Sample,
};
use std::sync::Arc;
use tracing::info;

/// How the library attaches to a hostengine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitMode {
    /// Run the engine inside this process.
    Embedded,
    /// Attach to a remote hostengine at `host:port`.
    Standalone(String),
}

/// DCGM-side log verbosity, mirrored from the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DcgmLogLevel {
    #[default]
    None,
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Verb,
}

impl std::str::FromStr for DcgmLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(DcgmLogLevel::None),
            "FATAL" => Ok(DcgmLogLevel::Fatal),
            "ERROR" => Ok(DcgmLogLevel::Error),
            "WARN" => Ok(DcgmLogLevel::Warn),
            "INFO" => Ok(DcgmLogLevel::Info),
            "DEBUG" => Ok(DcgmLogLevel::Debug),
            "VERB" => Ok(DcgmLogLevel::Verb),
            other => Err(format!("unknown DCGM log level '{other}'")),
        }
    }
}

/// Initialisation options for [`connect`].
#[derive(Debug, Clone)]
pub struct DcgmOptions {
    pub mode: InitMode,
    pub enable_logging: bool,
    pub log_level: DcgmLogLevel,
    /// Synthesised topology for `--fake-gpus` runs.
    pub fake_topology: Option<EngineTopology>,
}

impl Default for DcgmOptions {
    fn default() -> Self {
        Self {
            mode: InitMode::Embedded,
            enable_logging: false,
            log_level: DcgmLogLevel::None,
            fake_topology: None,
        }
    }
}

/// Operations the collection pipeline performs against DCGM.
///
/// Read-like calls are safe from any thread; group, field-group and watch
/// mutations are serialised inside one scrape by the pipeline driver.
pub trait DcgmClient: Send + Sync {
    fn create_group(&self, name: &str) -> Result<GroupHandle, DcgmError>;
    fn destroy_group(&self, group: GroupHandle) -> Result<(), DcgmError>;
    fn add_entity_to_group(&self, group: GroupHandle, entity: EntityId) -> Result<(), DcgmError>;
    /// Links are addressed by `(linkIndex, parentSwitch)` rather than id.
    fn add_link_entity_to_group(
        &self,
        group: GroupHandle,
        link_index: u32,
        parent_switch: u32,
    ) -> Result<(), DcgmError>;

    fn field_group_create(&self, name: &str, field_ids: &[u16])
        -> Result<FieldGroupHandle, DcgmError>;
    fn field_group_destroy(&self, field_group: FieldGroupHandle) -> Result<(), DcgmError>;

    fn watch_fields_with_group(
        &self,
        field_group: FieldGroupHandle,
        group: GroupHandle,
        update_freq_us: i64,
        max_keep_age_secs: f64,
        max_keep_samples: i32,
    ) -> Result<(), DcgmError>;

    fn update_all_fields(&self, wait_for_update: bool) -> Result<(), DcgmError>;

    fn entity_get_latest_values(
        &self,
        entity: EntityId,
        field_ids: &[u16],
    ) -> Result<Vec<Sample>, DcgmError>;

    fn link_get_latest_values(
        &self,
        link_index: u32,
        parent_switch: u32,
        field_ids: &[u16],
    ) -> Result<Vec<Sample>, DcgmError>;

    /// Batched latest-value read; `live` bypasses the watch cache.
    fn entities_get_latest_values(
        &self,
        entities: &[EntityId],
        field_ids: &[u16],
        live: bool,
    ) -> Result<Vec<Sample>, DcgmError>;

    /// All samples recorded for the group's watched fields since `since_us`.
    /// Returns the samples and the timestamp to resume from.
    fn get_values_since(
        &self,
        group: GroupHandle,
        field_group: FieldGroupHandle,
        since_us: i64,
    ) -> Result<(Vec<Sample>, i64), DcgmError>;

    fn get_all_device_count(&self) -> Result<u32, DcgmError>;
    fn device_info(&self, gpu_id: u32) -> Result<DeviceInfo, DcgmError>;
    fn gpu_instance_hierarchy(&self) -> Result<Vec<HierarchyEntry>, DcgmError>;
    fn cpu_hierarchy(&self) -> Result<Vec<CpuHierarchyEntry>, DcgmError>;
    fn nvlink_status(&self) -> Result<Vec<NvLinkStatus>, DcgmError>;
    fn entity_group_entities(&self, group: EntityGroup) -> Result<Vec<u32>, DcgmError>;

    fn field_meta(&self, field_id: u16) -> Result<FieldMeta, DcgmError>;
    fn field_id_by_name(&self, name: &str) -> Option<u16>;

    /// Releases the hostengine connection. Idempotent.
    fn shutdown(&self);
}

/// Initialise the DCGM collaborator per the supplied options.
pub fn connect(options: &DcgmOptions) -> Result<Arc<dyn DcgmClient>, DcgmError> {
    match &options.mode {
        InitMode::Embedded => info!("initialising DCGM in embedded mode"),
        InitMode::Standalone(addr) => {
            info!(hostengine = %addr, "attaching to remote DCGM hostengine")
        }
    }
    if options.enable_logging {
        info!(level = ?options.log_level, "streaming DCGM logs to stdout");
    }

    let engine = match &options.fake_topology {
        Some(topology) => EmbeddedEngine::with_topology(topology.clone()).synthesizing(),
        None => EmbeddedEngine::discovering(),
    };
    Ok(Arc::new(engine))
}
