//! # Subscription / Update-Policy Manager
//!
//! Tracks, per remote identity, which entities that remote wants location
//! updates for, and hands the transmission path the per-subscription
//! sequence counters it stamps onto outgoing batches.
//!
//! Three parallel address spaces exist (cluster nodes, external object
//! hosts, and individual objects), all backed by one index keyed on the
//! tagged remote identity.
//! The policy owns no transport state: it is pure bookkeeping that the
//! transmission logic consults to decide fan-out destinations.
//!
//! The policy registers itself as a location listener with
//! `want_aggregates = true`, so it observes both leaf and aggregate churn
//! and can drop subscriptions for entities that leave the world.

use crate::location::{
    LocationListener, LocationService, RemovalCompletion, UnsubscribeCallback,
};
use crate::types::{EntityId, RemoteId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Shared, monotonically increasing sequence counter for one subscription.
///
/// The handle is shared with the transmission path so every batched update
/// for the subscription carries a number the receiver can use to detect
/// drops or reordering and request a resync.
pub type SeqNoHandle = Arc<AtomicU64>;

/// Draws the next sequence number from a handle.
pub fn next_seqno(handle: &SeqNoHandle) -> u64 {
    handle.fetch_add(1, Ordering::AcqRel)
}

/// One remote's interest in one entity.
#[derive(Debug)]
struct SubscriptionRecord {
    /// Query indices this subscription was established under; empty for a
    /// plain (un-indexed) subscription.
    index_ids: HashSet<u32>,
    seqno: SeqNoHandle,
}

/// Per-address-space subscription index.
#[derive(Debug, Default)]
struct SubscriberIndex {
    subs: HashMap<RemoteId, HashMap<EntityId, SubscriptionRecord>>,
}

impl SubscriberIndex {
    /// Idempotent subscribe: re-subscribing refreshes the existing record
    /// instead of stacking a second one.
    fn subscribe(
        &mut self,
        remote: RemoteId,
        entity: EntityId,
        index_id: Option<u32>,
        seqno: Option<SeqNoHandle>,
    ) {
        let record = self
            .subs
            .entry(remote)
            .or_default()
            .entry(entity)
            .or_insert_with(|| SubscriptionRecord {
                index_ids: HashSet::new(),
                seqno: seqno.clone().unwrap_or_default(),
            });
        if let Some(handle) = seqno {
            record.seqno = handle;
        }
        if let Some(index_id) = index_id {
            record.index_ids.insert(index_id);
        }
    }

    /// Unsubscribing a nonexistent record is a no-op. Without an index the
    /// whole record goes; with one, the record survives until its last
    /// index is gone.
    fn unsubscribe(&mut self, remote: &RemoteId, entity: EntityId, index_id: Option<u32>) {
        let Some(entities) = self.subs.get_mut(remote) else {
            return;
        };
        match index_id {
            None => {
                entities.remove(&entity);
            }
            Some(index_id) => {
                if let Some(record) = entities.get_mut(&entity) {
                    record.index_ids.remove(&index_id);
                    if record.index_ids.is_empty() {
                        entities.remove(&entity);
                    }
                }
            }
        }
        if entities.is_empty() {
            self.subs.remove(remote);
        }
    }

    fn unsubscribe_all(&mut self, remote: &RemoteId) -> usize {
        self.subs.remove(remote).map(|e| e.len()).unwrap_or(0)
    }

    fn purge_entity(&mut self, entity: EntityId) {
        self.subs.retain(|_, entities| {
            entities.remove(&entity);
            !entities.is_empty()
        });
    }

    fn is_subscribed(&self, remote: &RemoteId, entity: EntityId) -> bool {
        self.subs
            .get(remote)
            .map(|e| e.contains_key(&entity))
            .unwrap_or(false)
    }

    fn subscribers_of(&self, entity: EntityId) -> Vec<RemoteId> {
        self.subs
            .iter()
            .filter(|(_, entities)| entities.contains_key(&entity))
            .map(|(remote, _)| *remote)
            .collect()
    }

    fn seqno(&self, remote: &RemoteId, entity: EntityId) -> Option<SeqNoHandle> {
        self.subs
            .get(remote)
            .and_then(|e| e.get(&entity))
            .map(|r| r.seqno.clone())
    }
}

/// Counters describing the churn the policy has observed as a listener.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyStats {
    /// Local (incl. aggregate) location updates observed.
    pub local_updates_observed: u64,
    /// Local objects removed, each purging its subscriptions.
    pub local_removals_observed: u64,
    /// Subscriptions torn down in bulk.
    pub bulk_teardowns: u64,
}

/// Location update policy: subscription bookkeeping for the three remote
/// address spaces plus the listener hook that keeps it consistent with the
/// location store.
pub struct LocationUpdatePolicy {
    index: RwLock<SubscriberIndex>,
    stats: RwLock<PolicyStats>,
}

impl LocationUpdatePolicy {
    /// Creates an empty policy.
    pub fn new() -> Self {
        Self {
            index: RwLock::new(SubscriberIndex::default()),
            stats: RwLock::new(PolicyStats::default()),
        }
    }

    /// Binds the policy to a location service and registers it as a
    /// listener with `want_aggregates = true`, so the policy observes both
    /// leaf and aggregate churn.
    pub async fn initialize(self: &Arc<Self>, service: &Arc<LocationService>) {
        service
            .add_listener(self.clone() as Arc<dyn LocationListener>, true)
            .await;
        service.set_update_policy(self.clone()).await;
    }

    /// Subscribes `remote` to updates for `entity`.
    ///
    /// Passing a [`SeqNoHandle`] shares the caller's counter with the
    /// transmission path; without one a fresh counter is created.
    /// Re-subscribing is idempotent.
    pub async fn subscribe(&self, remote: RemoteId, entity: EntityId, seqno: Option<SeqNoHandle>) {
        debug!("🔔 {} subscribed to {}", remote, entity);
        self.index
            .write()
            .await
            .subscribe(remote, entity, None, seqno);
    }

    /// Subscribes `remote` to updates for `entity` under a specific
    /// proximity query index.
    pub async fn subscribe_indexed(
        &self,
        remote: RemoteId,
        entity: EntityId,
        index_id: u32,
        seqno: Option<SeqNoHandle>,
    ) {
        debug!("🔔 {} subscribed to {} (index {})", remote, entity, index_id);
        self.index
            .write()
            .await
            .subscribe(remote, entity, Some(index_id), seqno);
    }

    /// Removes `remote`'s subscription for `entity`.
    pub async fn unsubscribe(&self, remote: RemoteId, entity: EntityId) {
        self.index.write().await.unsubscribe(&remote, entity, None);
    }

    /// Removes `remote`'s subscription for `entity` under one query index.
    pub async fn unsubscribe_indexed(&self, remote: RemoteId, entity: EntityId, index_id: u32) {
        self.index
            .write()
            .await
            .unsubscribe(&remote, entity, Some(index_id));
    }

    /// Tears down every subscription held by `remote`, then invokes
    /// `on_complete`.
    pub async fn unsubscribe_all(&self, remote: RemoteId, on_complete: UnsubscribeCallback) {
        let removed = self.index.write().await.unsubscribe_all(&remote);
        self.stats.write().await.bulk_teardowns += 1;
        debug!("🔕 {} unsubscribed from {} entities", remote, removed);
        on_complete();
    }

    /// Whether `remote` currently subscribes to `entity`.
    pub async fn is_subscribed(&self, remote: RemoteId, entity: EntityId) -> bool {
        self.index.read().await.is_subscribed(&remote, entity)
    }

    /// Every remote subscribed to `entity`, across all three address
    /// spaces. This is the fan-out set the transmission path consults.
    pub async fn subscribers_of(&self, entity: EntityId) -> Vec<RemoteId> {
        self.index.read().await.subscribers_of(entity)
    }

    /// The sequence counter for `(remote, entity)`, if subscribed.
    pub async fn seqno(&self, remote: RemoteId, entity: EntityId) -> Option<SeqNoHandle> {
        self.index.read().await.seqno(&remote, entity)
    }

    /// Observed-churn counters.
    pub async fn stats(&self) -> PolicyStats {
        *self.stats.read().await
    }
}

impl Default for LocationUpdatePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocationUpdatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationUpdatePolicy").finish_non_exhaustive()
    }
}

#[async_trait]
impl LocationListener for LocationUpdatePolicy {
    async fn local_location_updated(
        &self,
        _id: EntityId,
        _aggregate: bool,
        _new_value: crate::types::TimedMotionVector,
    ) {
        self.stats.write().await.local_updates_observed += 1;
    }

    async fn local_object_removed(
        &self,
        id: EntityId,
        _aggregate: bool,
        completion: RemovalCompletion,
    ) {
        // An entity that left the world can have no subscribers.
        self.index.write().await.purge_entity(id);
        self.stats.write().await.local_removals_observed += 1;
        completion.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    fn remote() -> RemoteId {
        RemoteId::ClusterNode(NodeId(2))
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent_not_refcounted() {
        let policy = LocationUpdatePolicy::new();
        let entity = EntityId::new();

        policy.subscribe(remote(), entity, None).await;
        policy.subscribe(remote(), entity, None).await;
        assert!(policy.is_subscribed(remote(), entity).await);

        // A single unsubscribe clears the doubly-subscribed record.
        policy.unsubscribe(remote(), entity).await;
        assert!(!policy.is_subscribed(remote(), entity).await);
    }

    #[tokio::test]
    async fn test_unsubscribe_nonexistent_is_noop() {
        let policy = LocationUpdatePolicy::new();
        policy.unsubscribe(remote(), EntityId::new()).await;
        policy
            .unsubscribe_indexed(remote(), EntityId::new(), 9)
            .await;
    }

    #[tokio::test]
    async fn test_indexed_subscriptions_tear_down_per_index() {
        let policy = LocationUpdatePolicy::new();
        let entity = EntityId::new();

        policy.subscribe_indexed(remote(), entity, 1, None).await;
        policy.subscribe_indexed(remote(), entity, 2, None).await;

        policy.unsubscribe_indexed(remote(), entity, 1).await;
        assert!(policy.is_subscribed(remote(), entity).await);

        policy.unsubscribe_indexed(remote(), entity, 2).await;
        assert!(!policy.is_subscribed(remote(), entity).await);
    }

    #[tokio::test]
    async fn test_bulk_teardown_invokes_callback() {
        let policy = LocationUpdatePolicy::new();
        let e1 = EntityId::new();
        let e2 = EntityId::new();
        policy.subscribe(remote(), e1, None).await;
        policy.subscribe(remote(), e2, None).await;

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = fired.clone();
        policy
            .unsubscribe_all(
                remote(),
                Box::new(move || {
                    fired_clone.store(true, Ordering::SeqCst);
                }),
            )
            .await;

        assert!(fired.load(Ordering::SeqCst));
        assert!(!policy.is_subscribed(remote(), e1).await);
        assert!(!policy.is_subscribed(remote(), e2).await);
    }

    #[tokio::test]
    async fn test_address_spaces_are_parallel() {
        let policy = LocationUpdatePolicy::new();
        let entity = EntityId::new();
        let node = RemoteId::ClusterNode(NodeId(3));
        let host = RemoteId::ObjectHost(crate::types::ObjectHostId::new());
        let object = RemoteId::Object(EntityId::new());

        policy.subscribe(node, entity, None).await;
        policy.subscribe(host, entity, None).await;
        policy.subscribe(object, entity, None).await;

        let mut fan_out = policy.subscribers_of(entity).await;
        fan_out.sort_by_key(|r| format!("{r:?}"));
        assert_eq!(fan_out.len(), 3);

        policy.unsubscribe(node, entity).await;
        assert_eq!(policy.subscribers_of(entity).await.len(), 2);
    }

    #[tokio::test]
    async fn test_shared_seqno_handle_is_used() {
        let policy = LocationUpdatePolicy::new();
        let entity = EntityId::new();
        let handle: SeqNoHandle = Arc::new(AtomicU64::new(7));

        policy
            .subscribe(remote(), entity, Some(handle.clone()))
            .await;
        let stored = policy.seqno(remote(), entity).await.unwrap();
        assert_eq!(next_seqno(&stored), 7);
        // The caller's handle advanced too: one shared counter.
        assert_eq!(handle.load(Ordering::Acquire), 8);
    }

    #[tokio::test]
    async fn test_policy_purges_subscriptions_on_local_removal() {
        let (service, policy) = crate::create_location_service().await;

        let entity = EntityId::new();
        service
            .add_local_object(
                entity,
                false,
                crate::types::TimedMotionVector::default(),
                crate::types::TimedMotionQuaternion::default(),
                crate::types::AggregateBounds::default(),
                String::new(),
                String::new(),
                String::new(),
            )
            .await
            .unwrap();
        service.subscribe(remote(), entity, None).await;
        assert!(policy.is_subscribed(remote(), entity).await);

        service
            .remove_local_object(entity, Box::new(|| {}))
            .await
            .unwrap();
        assert!(!policy.is_subscribed(remote(), entity).await);
        assert_eq!(policy.stats().await.local_removals_observed, 1);
    }
}
