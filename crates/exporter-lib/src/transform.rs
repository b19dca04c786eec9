//! Snapshot transforms
//!
//! Transforms run between collection and rendering, in registration order,
//! and may rewrite any metric in the snapshot. The pod mapper is the only
//! built-in transform.

use async_trait::async_trait;

use crate::collector::Snapshot;
use crate::devices::Inventory;
use crate::error::Result;

#[async_trait]
pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rewrite the snapshot in place.
    async fn process(&self, snapshot: &mut Snapshot, inventory: &Inventory) -> Result<()>;
}
