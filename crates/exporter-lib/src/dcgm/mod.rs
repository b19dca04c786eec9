//! DCGM collaborator: operation contract, field catalogue and the
//! in-process engine used for fake-GPU runs and tests.

mod client;
mod engine;
pub mod fields;
mod types;

pub use client::{connect, DcgmClient, DcgmLogLevel, DcgmOptions, InitMode};
pub use engine::{now_us, EmbeddedEngine, EngineTopology, SimGpu, SimMigInstance, SimSwitch};
pub use types::{
    CpuHierarchyEntry, DcgmError, DeviceInfo, EntityGroup, EntityId, FieldGroupHandle, FieldMeta,
    FieldScope, FieldType, FieldValue, GroupHandle, HierarchyEntry, NvLinkStatus, Sample,
    FP64_BLANK, INT32_BLANK, INT64_BLANK, STR_BLANK, STR_NOT_FOUND, STR_NOT_PERMISSIONED,
    STR_NOT_SUPPORTED,
};
