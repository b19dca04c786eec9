//! Static DCGM field catalogue
//!
//! The subset of the DCGM field table the default counter sets reference,
//! with the declared value scope and wire type for each field. The embedded
//! engine resolves `FieldGetById`/name lookups against this table.

use super::types::{FieldMeta, FieldScope, FieldType};

/// Field id of the driver version label field.
pub const DCGM_FI_DRIVER_VERSION: u16 = 1;
/// Device name; read with the live flag to resolve MIG profile names.
pub const DCGM_FI_DEV_NAME: u16 = 50;
pub const DCGM_FI_DEV_SM_CLOCK: u16 = 100;
pub const DCGM_FI_DEV_MEM_CLOCK: u16 = 101;
pub const DCGM_FI_DEV_CLOCK_THROTTLE_REASONS: u16 = 112;
pub const DCGM_FI_DEV_MEMORY_TEMP: u16 = 140;
pub const DCGM_FI_DEV_GPU_TEMP: u16 = 150;
pub const DCGM_FI_DEV_POWER_USAGE: u16 = 155;
pub const DCGM_FI_DEV_TOTAL_ENERGY_CONSUMPTION: u16 = 156;
pub const DCGM_FI_DEV_PCIE_TX_THROUGHPUT: u16 = 200;
pub const DCGM_FI_DEV_PCIE_RX_THROUGHPUT: u16 = 201;
pub const DCGM_FI_DEV_PCIE_REPLAY_COUNTER: u16 = 202;
pub const DCGM_FI_DEV_GPU_UTIL: u16 = 203;
pub const DCGM_FI_DEV_MEM_COPY_UTIL: u16 = 204;
pub const DCGM_FI_DEV_ENC_UTIL: u16 = 206;
pub const DCGM_FI_DEV_DEC_UTIL: u16 = 207;
pub const DCGM_FI_DEV_XID_ERRORS: u16 = 230;
pub const DCGM_FI_DEV_POWER_VIOLATION: u16 = 240;
pub const DCGM_FI_DEV_THERMAL_VIOLATION: u16 = 241;
pub const DCGM_FI_DEV_FB_TOTAL: u16 = 250;
pub const DCGM_FI_DEV_FB_FREE: u16 = 251;
pub const DCGM_FI_DEV_FB_USED: u16 = 252;
pub const DCGM_FI_DEV_ECC_SBE_VOL_TOTAL: u16 = 310;
pub const DCGM_FI_DEV_ECC_DBE_VOL_TOTAL: u16 = 311;
pub const DCGM_FI_DEV_NVLINK_BANDWIDTH_TOTAL: u16 = 449;
pub const DCGM_FI_DEV_VGPU_LICENSE_STATUS: u16 = 571;
pub const DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_TX: u16 = 780;
pub const DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_RX: u16 = 781;
pub const DCGM_FI_DEV_NVSWITCH_TEMPERATURE_CURRENT: u16 = 857;
pub const DCGM_FI_DEV_CPU_UTIL_TOTAL: u16 = 1100;
pub const DCGM_FI_DEV_CPU_TEMP_CURRENT: u16 = 1110;
pub const DCGM_FI_DEV_CPU_POWER_UTIL_CURRENT: u16 = 1120;
pub const DCGM_FI_PROF_GR_ENGINE_ACTIVE: u16 = 1001;
pub const DCGM_FI_PROF_SM_ACTIVE: u16 = 1002;
pub const DCGM_FI_PROF_SM_OCCUPANCY: u16 = 1003;
pub const DCGM_FI_PROF_PIPE_TENSOR_ACTIVE: u16 = 1004;
pub const DCGM_FI_PROF_DRAM_ACTIVE: u16 = 1005;
pub const DCGM_FI_PROF_PCIE_TX_BYTES: u16 = 1009;
pub const DCGM_FI_PROF_PCIE_RX_BYTES: u16 = 1010;
pub const DCGM_FI_PROF_NVLINK_TX_BYTES: u16 = 1011;
pub const DCGM_FI_PROF_NVLINK_RX_BYTES: u16 = 1012;

/// Largest number of entities one DCGM group accepts.
pub const DCGM_GROUP_MAX_ENTITIES: usize = 64;

/// Upper bound when scanning CPU core-ownership bitmasks.
pub const DCGM_MAX_NUM_CPU_CORES: usize = 1024;

macro_rules! field {
    ($id:expr, $name:expr, $scope:ident, $ty:ident) => {
        FieldMeta {
            field_id: $id,
            name: $name,
            scope: FieldScope::$scope,
            field_type: FieldType::$ty,
        }
    };
}

/// The catalogue, ordered by field id.
pub static FIELDS: &[FieldMeta] = &[
    field!(DCGM_FI_DRIVER_VERSION, "DCGM_FI_DRIVER_VERSION", None, String),
    field!(DCGM_FI_DEV_NAME, "DCGM_FI_DEV_NAME", Gpu, String),
    field!(DCGM_FI_DEV_SM_CLOCK, "DCGM_FI_DEV_SM_CLOCK", Gpu, Int64),
    field!(DCGM_FI_DEV_MEM_CLOCK, "DCGM_FI_DEV_MEM_CLOCK", Gpu, Int64),
    field!(
        DCGM_FI_DEV_CLOCK_THROTTLE_REASONS,
        "DCGM_FI_DEV_CLOCK_THROTTLE_REASONS",
        Gpu,
        Int64
    ),
    field!(DCGM_FI_DEV_MEMORY_TEMP, "DCGM_FI_DEV_MEMORY_TEMP", Gpu, Int64),
    field!(DCGM_FI_DEV_GPU_TEMP, "DCGM_FI_DEV_GPU_TEMP", Gpu, Int64),
    field!(DCGM_FI_DEV_POWER_USAGE, "DCGM_FI_DEV_POWER_USAGE", Gpu, Double),
    field!(
        DCGM_FI_DEV_TOTAL_ENERGY_CONSUMPTION,
        "DCGM_FI_DEV_TOTAL_ENERGY_CONSUMPTION",
        Gpu,
        Int64
    ),
    field!(
        DCGM_FI_DEV_PCIE_TX_THROUGHPUT,
        "DCGM_FI_DEV_PCIE_TX_THROUGHPUT",
        Gpu,
        Int64
    ),
    field!(
        DCGM_FI_DEV_PCIE_RX_THROUGHPUT,
        "DCGM_FI_DEV_PCIE_RX_THROUGHPUT",
        Gpu,
        Int64
    ),
    field!(
        DCGM_FI_DEV_PCIE_REPLAY_COUNTER,
        "DCGM_FI_DEV_PCIE_REPLAY_COUNTER",
        Gpu,
        Int64
    ),
    field!(DCGM_FI_DEV_GPU_UTIL, "DCGM_FI_DEV_GPU_UTIL", Gpu, Int64),
    field!(DCGM_FI_DEV_MEM_COPY_UTIL, "DCGM_FI_DEV_MEM_COPY_UTIL", Gpu, Int64),
    field!(DCGM_FI_DEV_ENC_UTIL, "DCGM_FI_DEV_ENC_UTIL", Gpu, Int64),
    field!(DCGM_FI_DEV_DEC_UTIL, "DCGM_FI_DEV_DEC_UTIL", Gpu, Int64),
    field!(DCGM_FI_DEV_XID_ERRORS, "DCGM_FI_DEV_XID_ERRORS", Gpu, Int64),
    field!(DCGM_FI_DEV_POWER_VIOLATION, "DCGM_FI_DEV_POWER_VIOLATION", Gpu, Int64),
    field!(
        DCGM_FI_DEV_THERMAL_VIOLATION,
        "DCGM_FI_DEV_THERMAL_VIOLATION",
        Gpu,
        Int64
    ),
    field!(DCGM_FI_DEV_FB_TOTAL, "DCGM_FI_DEV_FB_TOTAL", Gpu, Int64),
    field!(DCGM_FI_DEV_FB_FREE, "DCGM_FI_DEV_FB_FREE", Gpu, Int64),
    field!(DCGM_FI_DEV_FB_USED, "DCGM_FI_DEV_FB_USED", Gpu, Int64),
    field!(DCGM_FI_DEV_ECC_SBE_VOL_TOTAL, "DCGM_FI_DEV_ECC_SBE_VOL_TOTAL", Gpu, Int64),
    field!(DCGM_FI_DEV_ECC_DBE_VOL_TOTAL, "DCGM_FI_DEV_ECC_DBE_VOL_TOTAL", Gpu, Int64),
    field!(
        DCGM_FI_DEV_NVLINK_BANDWIDTH_TOTAL,
        "DCGM_FI_DEV_NVLINK_BANDWIDTH_TOTAL",
        Gpu,
        Int64
    ),
    field!(
        DCGM_FI_DEV_VGPU_LICENSE_STATUS,
        "DCGM_FI_DEV_VGPU_LICENSE_STATUS",
        Vgpu,
        Int64
    ),
    field!(
        DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_TX,
        "DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_TX",
        Link,
        Int64
    ),
    field!(
        DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_RX,
        "DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_RX",
        Link,
        Int64
    ),
    field!(
        DCGM_FI_DEV_NVSWITCH_TEMPERATURE_CURRENT,
        "DCGM_FI_DEV_NVSWITCH_TEMPERATURE_CURRENT",
        Switch,
        Int64
    ),
    field!(DCGM_FI_PROF_GR_ENGINE_ACTIVE, "DCGM_FI_PROF_GR_ENGINE_ACTIVE", Gpu, Double),
    field!(DCGM_FI_PROF_SM_ACTIVE, "DCGM_FI_PROF_SM_ACTIVE", Gpu, Double),
    field!(DCGM_FI_PROF_SM_OCCUPANCY, "DCGM_FI_PROF_SM_OCCUPANCY", Gpu, Double),
    field!(
        DCGM_FI_PROF_PIPE_TENSOR_ACTIVE,
        "DCGM_FI_PROF_PIPE_TENSOR_ACTIVE",
        Gpu,
        Double
    ),
    field!(DCGM_FI_PROF_DRAM_ACTIVE, "DCGM_FI_PROF_DRAM_ACTIVE", Gpu, Double),
    field!(DCGM_FI_PROF_PCIE_TX_BYTES, "DCGM_FI_PROF_PCIE_TX_BYTES", Gpu, Int64),
    field!(DCGM_FI_PROF_PCIE_RX_BYTES, "DCGM_FI_PROF_PCIE_RX_BYTES", Gpu, Int64),
    field!(DCGM_FI_PROF_NVLINK_TX_BYTES, "DCGM_FI_PROF_NVLINK_TX_BYTES", Gpu, Int64),
    field!(DCGM_FI_PROF_NVLINK_RX_BYTES, "DCGM_FI_PROF_NVLINK_RX_BYTES", Gpu, Int64),
    field!(DCGM_FI_DEV_CPU_UTIL_TOTAL, "DCGM_FI_DEV_CPU_UTIL_TOTAL", CpuCore, Double),
    field!(DCGM_FI_DEV_CPU_TEMP_CURRENT, "DCGM_FI_DEV_CPU_TEMP_CURRENT", Cpu, Double),
    field!(
        DCGM_FI_DEV_CPU_POWER_UTIL_CURRENT,
        "DCGM_FI_DEV_CPU_POWER_UTIL_CURRENT",
        Cpu,
        Double
    ),
];

/// Look up field metadata by id.
pub fn field_by_id(field_id: u16) -> Option<&'static FieldMeta> {
    FIELDS.iter().find(|f| f.field_id == field_id)
}

/// Look up field metadata by its `DCGM_FI_*` name.
pub fn field_by_name(name: &str) -> Option<&'static FieldMeta> {
    FIELDS.iter().find(|f| f.name == name)
}
