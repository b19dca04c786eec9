//! Core DCGM data types
//!
//! Entity addressing, sampled values and the sentinel ("blank") encodings
//! the library uses to flag missing or unsupported readings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Entity classes DCGM can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum EntityGroup {
    Gpu = 1,
    Vgpu = 2,
    Switch = 3,
    GpuInstance = 4,
    ComputeInstance = 5,
    Link = 6,
    Cpu = 7,
    CpuCore = 8,
}

impl EntityGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityGroup::Gpu => "GPU",
            EntityGroup::Vgpu => "vGPU",
            EntityGroup::Switch => "Switch",
            EntityGroup::GpuInstance => "GPU instance",
            EntityGroup::ComputeInstance => "compute instance",
            EntityGroup::Link => "NvLink",
            EntityGroup::Cpu => "CPU",
            EntityGroup::CpuCore => "CPU core",
        }
    }
}

/// (group, id) pair addressing one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId {
    pub group: EntityGroup,
    pub id: u32,
}

impl EntityId {
    pub fn new(group: EntityGroup, id: u32) -> Self {
        Self { group, id }
    }
}

/// Value scopes a field is declared against.
///
/// `None` acts as a wildcard when matching fields to entity classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldScope {
    None,
    Gpu,
    Vgpu,
    Switch,
    Link,
    GpuInstance,
    ComputeInstance,
    Cpu,
    CpuCore,
}

/// Wire type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int64,
    Double,
    String,
    Binary,
}

/// Field metadata as reported by the field catalogue.
#[derive(Debug, Clone)]
pub struct FieldMeta {
    pub field_id: u16,
    pub name: &'static str,
    pub scope: FieldScope,
    pub field_type: FieldType,
}

/// One sampled value for an (entity, field) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub entity: EntityId,
    pub field_id: u16,
    /// Microseconds since the unix epoch.
    pub timestamp_us: i64,
    /// DCGM per-sample status; 0 means ok.
    pub status: i32,
    pub value: FieldValue,
}

/// Typed sample payload.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int64(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
}

// Sentinel encodings from the DCGM headers. A reading equal to or above the
// blank base is absent/unsupported and must never become a metric.
pub const INT32_BLANK: i32 = 0x7ffffff0;
pub const INT64_BLANK: i64 = 0x7ff0000000000000;
pub const FP64_BLANK: f64 = 140737488355328.0;
pub const STR_BLANK: &str = "<<<NULL>>>";
pub const STR_NOT_FOUND: &str = "<<<NOT_FOUND>>>";
pub const STR_NOT_SUPPORTED: &str = "<<<NOT_SUPPORTED>>>";
pub const STR_NOT_PERMISSIONED: &str = "<<<NOT_PERM>>>";

impl FieldValue {
    /// True when the value is one of the DCGM sentinels for its type.
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Int64(v) => *v >= INT64_BLANK,
            FieldValue::Double(v) => *v >= FP64_BLANK,
            FieldValue::String(s) => {
                matches!(
                    s.as_str(),
                    STR_BLANK | STR_NOT_FOUND | STR_NOT_SUPPORTED | STR_NOT_PERMISSIONED
                )
            }
            FieldValue::Binary(_) => false,
        }
    }
}

/// GPU device identity from `GetDeviceInfo`.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub gpu_id: u32,
    pub uuid: String,
    pub model: String,
}

/// One row of the GPU instance hierarchy.
#[derive(Debug, Clone)]
pub struct HierarchyEntry {
    pub entity: EntityId,
    pub parent: EntityId,
    /// NVML-scoped instance id (stable within the parent GPU).
    pub info_id: u32,
}

/// NVLink status row: a link index under its parent entity.
#[derive(Debug, Clone)]
pub struct NvLinkStatus {
    pub parent: EntityId,
    pub link_index: u32,
    pub is_up: bool,
}

/// One CPU with the bitmask of cores it owns.
#[derive(Debug, Clone)]
pub struct CpuHierarchyEntry {
    pub cpu_id: u32,
    /// One bit per core, little-endian words.
    pub owned_cores: Vec<u64>,
}

impl CpuHierarchyEntry {
    /// Expand the ownership bitmask into core indices.
    pub fn core_ids(&self, max_cores: usize) -> Vec<u32> {
        let mut out = Vec::new();
        for core in 0..max_cores {
            let word = core / 64;
            let bit = core % 64;
            if self
                .owned_cores
                .get(word)
                .is_some_and(|w| w & (1u64 << bit) != 0)
            {
                out.push(core as u32);
            }
        }
        out
    }
}

/// Opaque handle to a DCGM entity group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupHandle(pub u64);

/// Opaque handle to a DCGM field group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldGroupHandle(pub u64);

/// Errors surfaced by the DCGM collaborator.
#[derive(Debug, Clone, Error)]
pub enum DcgmError {
    /// The connection to the hostengine was invalidated.
    #[error("connection to the DCGM hostengine was lost")]
    ConnectionLost,

    #[error("entity {0:?} is not known to DCGM")]
    UnknownEntity(EntityId),

    #[error("no such group handle {0:?}")]
    UnknownGroup(GroupHandle),

    #[error("no such field group handle {0:?}")]
    UnknownFieldGroup(FieldGroupHandle),

    #[error("field id {0} is not in the field catalogue")]
    UnknownField(u16),

    #[error("DCGM call failed: {0}")]
    Api(String),
}
