//! Soft-delete retention and recovery.
//!
//! A soft-deleted node stays in the graph for `retention.soft_delete_days`
//! (default 90) and can be restored to ARCHIVED during that window. Past
//! the window it is eligible for hard deletion by the maintenance purge
//! pass or an explicit [`purge_expired`] call.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::MemoryNode;
use crate::storage::GraphStore;

/// Whether a node soft-deleted at `soft_deleted_at` is still inside the
/// recovery window.
pub fn within_retention(
    soft_deleted_at: DateTime<Utc>,
    now: DateTime<Utc>,
    retention_days: u32,
) -> bool {
    now - soft_deleted_at < Duration::days(i64::from(retention_days))
}

/// Restore a soft-deleted node to ARCHIVED.
///
/// Clears `soft_deleted_at` and stamps `last_accessed_at = now` so the node
/// does not immediately re-expire. The access counter is preserved. Fails
/// with `NotRecoverable` when the node is not soft-deleted or the retention
/// window has elapsed.
pub async fn recover<S: GraphStore>(
    store: &S,
    uuid: Uuid,
    now: DateTime<Utc>,
    retention_days: u32,
) -> Result<MemoryNode> {
    let node = store.recover(uuid, now, retention_days).await?;
    tracing::info!(uuid = %uuid, "recovered soft-deleted memory to ARCHIVED");
    Ok(node)
}

/// Hard-delete every soft-deleted node past retention. Returns the number
/// of nodes purged.
pub async fn purge_expired<S: GraphStore>(
    store: &S,
    now: DateTime<Utc>,
    retention_days: u32,
) -> Result<usize> {
    let ids = store.list_purgeable(now, retention_days).await?;
    if ids.is_empty() {
        return Ok(0);
    }
    let purged = store.purge(&ids).await?;
    tracing::info!(purged, "purged soft-deleted memories past retention");
    Ok(purged)
}
