use async_trait::async_trait;

use crate::kafka::types::Partition;

/// Receives consumer-group membership changes from a broker client.
///
/// # Call order
///
/// Broker clients invoke these callbacks from inside their fetch path, so a
/// callback never runs concurrently with the dispatch of a fetched batch from
/// the same client:
///
/// ```text
/// fetch()
///     ├─► on_partitions_revoked(p)   - partitions leave this member cleanly
///     ├─► on_partitions_lost(p)      - partitions were taken away (session expired)
///     └─► on_partitions_assigned(p)  - partitions join this member
/// ```
///
/// With the cooperative protocol the lists are incremental: a callback names
/// only the partitions that changed, never the full assignment.
#[async_trait]
pub trait RebalanceHandler: Send + Sync {
    /// Partitions newly assigned to this member
    async fn on_partitions_assigned(&self, partitions: &[Partition]);

    /// Partitions being handed back to the group
    async fn on_partitions_revoked(&self, partitions: &[Partition]);

    /// Partitions lost without a clean handoff. Defaults to the revoke path.
    async fn on_partitions_lost(&self, partitions: &[Partition]) {
        self.on_partitions_revoked(partitions).await
    }
}
