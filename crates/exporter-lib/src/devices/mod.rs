//! Device discovery and selection.

mod inventory;
pub mod selection;

pub use inventory::{
    CpuInfo, DeviceOptions, GpuInfo, GpuInstanceInfo, Inventory, LinkInfo, SwitchInfo,
};
pub use selection::{parse as parse_selection, DeviceSelection, ALL};
