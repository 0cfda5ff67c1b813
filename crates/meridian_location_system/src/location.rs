//! # Location State & Listener Registry
//!
//! The authoritative per-entity location store for one node, together with
//! the listener fan-out that tells every interested subsystem about churn.
//!
//! Each record is either **local** (this node is authoritative for the
//! entity) or a **replica** (mirroring another node's authoritative copy);
//! the two never coexist for one entity, and a record must pass through the
//! absent state to change provenance. Aggregate records (synthetic entities
//! summarizing a group of leaves) follow the same lifecycle but are
//! filtered out for listeners that registered with `want_aggregates = false`.
//!
//! ## Removal completion
//!
//! Removing a local object is only finished once every interested listener
//! has finished its own (possibly asynchronous) cleanup. The registry hands
//! each listener a shared [`RemovalCompletion`] token backed by an explicit
//! atomic counter; the last `complete()` call fires the caller's callback
//! exactly once. Zero interested listeners fire the callback immediately.

use crate::error::LocationError;
use crate::protocol::BulkLocationUpdate;
use crate::subscription::{LocationUpdatePolicy, SeqNoHandle};
use crate::types::{
    AggregateBounds, EntityId, NodeId, RemoteId, TimedMotionQuaternion, TimedMotionVector,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Callback invoked once a local object removal has fully completed.
pub type RemovalCallback = Box<dyn FnOnce() + Send>;

/// Bulk-teardown completion callback.
pub type UnsubscribeCallback = Box<dyn FnOnce() + Send>;

// ============================================================================
// Removal completion token
// ============================================================================

struct RemovalInner {
    remaining: AtomicUsize,
    callback: Mutex<Option<RemovalCallback>>,
}

/// Shared completion token for a local object removal.
///
/// Each interested listener holds one clone and calls
/// [`complete`](Self::complete) when its removal handling, including any
/// asynchronous cleanup it kicked off, has finished. The callback fires on
/// the final completion and never more than once.
#[derive(Clone)]
pub struct RemovalCompletion {
    inner: Arc<RemovalInner>,
}

impl RemovalCompletion {
    fn new(interested: usize, callback: RemovalCallback) -> Self {
        Self {
            inner: Arc::new(RemovalInner {
                remaining: AtomicUsize::new(interested),
                callback: Mutex::new(Some(callback)),
            }),
        }
    }

    /// Acknowledges one listener's finished removal handling.
    ///
    /// The last acknowledgment triggers the original removal callback.
    pub fn complete(&self) {
        let prev = self.inner.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            let cb = self
                .inner
                .callback
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(cb) = cb {
                cb();
            }
        } else if prev == 0 {
            warn!("⚠️ RemovalCompletion over-released, callback already fired");
        }
    }
}

impl std::fmt::Debug for RemovalCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemovalCompletion")
            .field("remaining", &self.inner.remaining.load(Ordering::Acquire))
            .finish()
    }
}

// ============================================================================
// Listener interface
// ============================================================================

/// Notification interface for subsystems interested in location churn.
///
/// All methods default to no-ops so concrete listeners (forwarding,
/// replication, application-visible) implement only the notifications they
/// care about. The default for [`local_object_removed`] acknowledges the
/// completion token immediately; listeners that perform asynchronous cleanup
/// must override it and acknowledge only when that cleanup has finished.
///
/// [`local_object_removed`]: Self::local_object_removed
#[async_trait]
pub trait LocationListener: Send + Sync {
    /// A local object entered the world.
    #[allow(clippy::too_many_arguments)]
    async fn local_object_added(
        &self,
        _id: EntityId,
        _aggregate: bool,
        _location: TimedMotionVector,
        _orientation: TimedMotionQuaternion,
        _bounds: AggregateBounds,
        _mesh: &str,
        _physics: &str,
        _query_data: &str,
    ) {
    }

    /// A local object left the world. `completion` must be acknowledged
    /// exactly once when this listener's removal handling has finished.
    async fn local_object_removed(
        &self,
        _id: EntityId,
        _aggregate: bool,
        completion: RemovalCompletion,
    ) {
        completion.complete();
    }

    /// A local object's motion changed.
    async fn local_location_updated(
        &self,
        _id: EntityId,
        _aggregate: bool,
        _new_value: TimedMotionVector,
    ) {
    }

    /// A local object's rotational motion changed.
    async fn local_orientation_updated(
        &self,
        _id: EntityId,
        _aggregate: bool,
        _new_value: TimedMotionQuaternion,
    ) {
    }

    /// A local object's bounding volume changed.
    async fn local_bounds_updated(
        &self,
        _id: EntityId,
        _aggregate: bool,
        _new_value: AggregateBounds,
    ) {
    }

    /// A local object's mesh reference changed.
    async fn local_mesh_updated(&self, _id: EntityId, _aggregate: bool, _new_value: &str) {}

    /// A local object's physics metadata changed.
    async fn local_physics_updated(&self, _id: EntityId, _aggregate: bool, _new_value: &str) {}

    /// A local object's query data changed.
    async fn local_query_data_updated(&self, _id: EntityId, _aggregate: bool, _new_value: &str) {}

    /// A replica record was created for a remote object.
    #[allow(clippy::too_many_arguments)]
    async fn replica_object_added(
        &self,
        _id: EntityId,
        _location: TimedMotionVector,
        _orientation: TimedMotionQuaternion,
        _bounds: AggregateBounds,
        _mesh: &str,
        _physics: &str,
        _query_data: &str,
    ) {
    }

    /// A replica record was invalidated.
    async fn replica_object_removed(&self, _id: EntityId) {}

    /// A replica's motion was refreshed from its authoritative node.
    async fn replica_location_updated(&self, _id: EntityId, _new_value: TimedMotionVector) {}

    /// A replica's rotational motion was refreshed.
    async fn replica_orientation_updated(&self, _id: EntityId, _new_value: TimedMotionQuaternion) {}

    /// A replica's bounding volume was refreshed.
    async fn replica_bounds_updated(&self, _id: EntityId, _new_value: AggregateBounds) {}

    /// A replica's mesh reference was refreshed.
    async fn replica_mesh_updated(&self, _id: EntityId, _new_value: &str) {}

    /// A replica's physics metadata was refreshed.
    async fn replica_physics_updated(&self, _id: EntityId, _new_value: &str) {}

    /// A replica's query data was refreshed.
    async fn replica_query_data_updated(&self, _id: EntityId, _new_value: &str) {}

    /// A raw inter-node update batch arrived, delivered before any per-field
    /// application so server-level handlers can forward or merge it.
    async fn location_update_from_server(&self, _node: NodeId, _update: &BulkLocationUpdate) {}
}

#[derive(Clone)]
struct ListenerEntry {
    listener: Arc<dyn LocationListener>,
    want_aggregates: bool,
}

// ============================================================================
// Records
// ============================================================================

/// Provenance of a location record: exactly one holds at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// This node is authoritative for the entity.
    Local,
    /// The record mirrors another node's authoritative copy.
    Replica,
}

impl Provenance {
    fn name(self) -> &'static str {
        match self {
            Provenance::Local => "local",
            Provenance::Replica => "replica",
        }
    }
}

/// The full per-entity state tracked by the location service.
#[derive(Debug, Clone)]
pub struct LocationRecord {
    /// The entity this record describes.
    pub id: EntityId,
    /// True when the record summarizes a merged group of entities.
    pub is_aggregate: bool,
    /// Local vs. replica provenance.
    pub provenance: Provenance,
    /// Timestamped translational motion.
    pub location: TimedMotionVector,
    /// Timestamped rotational motion.
    pub orientation: TimedMotionQuaternion,
    /// Aggregate bounding volume descriptor.
    pub bounds: AggregateBounds,
    /// Opaque mesh reference.
    pub mesh: String,
    /// Opaque physics metadata.
    pub physics: String,
    /// Opaque query data consumed by the proximity layer.
    pub query_data: String,
}

// ============================================================================
// Service
// ============================================================================

/// Authoritative location state store and listener registry for one node.
///
/// Listener notification order follows registration order. Notifications
/// iterate a defensive snapshot of the listener list, so a listener may
/// unregister itself (or others) from within its own callback without
/// corrupting the in-progress fan-out.
pub struct LocationService {
    records: RwLock<HashMap<EntityId, LocationRecord>>,
    listeners: RwLock<Vec<ListenerEntry>>,
    update_policy: RwLock<Option<Arc<LocationUpdatePolicy>>>,
}

impl LocationService {
    /// Creates an empty location service.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            update_policy: RwLock::new(None),
        }
    }

    /// Binds the update policy this service delegates subscriptions to.
    ///
    /// Called by [`LocationUpdatePolicy::initialize`]; the policy also
    /// registers itself as a listener with `want_aggregates = true`.
    pub async fn set_update_policy(&self, policy: Arc<LocationUpdatePolicy>) {
        *self.update_policy.write().await = Some(policy);
    }

    // ------------------------------------------------------------------
    // Listener registry
    // ------------------------------------------------------------------

    /// Registers a listener. `want_aggregates = false` skips the listener
    /// for local updates tagged as aggregate.
    pub async fn add_listener(&self, listener: Arc<dyn LocationListener>, want_aggregates: bool) {
        self.listeners.write().await.push(ListenerEntry {
            listener,
            want_aggregates,
        });
    }

    /// Unregisters a listener by identity. Unknown listeners are a no-op.
    pub async fn remove_listener(&self, listener: &Arc<dyn LocationListener>) {
        let mut listeners = self.listeners.write().await;
        if let Some(pos) = listeners
            .iter()
            .position(|e| Arc::ptr_eq(&e.listener, listener))
        {
            listeners.remove(pos);
        }
    }

    /// Number of registered listeners.
    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    async fn snapshot(&self) -> Vec<ListenerEntry> {
        self.listeners.read().await.clone()
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Whether any record exists for `id`.
    pub async fn contains(&self, id: EntityId) -> bool {
        self.records.read().await.contains_key(&id)
    }

    /// Full record for `id`, if tracked.
    pub async fn record(&self, id: EntityId) -> Option<LocationRecord> {
        self.records.read().await.get(&id).cloned()
    }

    /// Motion sample for `id`, if tracked.
    pub async fn location(&self, id: EntityId) -> Option<TimedMotionVector> {
        self.records.read().await.get(&id).map(|r| r.location)
    }

    /// Provenance for `id`, if tracked.
    pub async fn provenance(&self, id: EntityId) -> Option<Provenance> {
        self.records.read().await.get(&id).map(|r| r.provenance)
    }

    /// Number of tracked entities.
    pub async fn tracked_count(&self) -> usize {
        self.records.read().await.len()
    }

    // ------------------------------------------------------------------
    // Local lifecycle
    // ------------------------------------------------------------------

    /// Creates a local (authoritative) record and notifies listeners.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_local_object(
        &self,
        id: EntityId,
        aggregate: bool,
        location: TimedMotionVector,
        orientation: TimedMotionQuaternion,
        bounds: AggregateBounds,
        mesh: String,
        physics: String,
        query_data: String,
    ) -> Result<(), LocationError> {
        {
            let mut records = self.records.write().await;
            if records.contains_key(&id) {
                return Err(LocationError::AlreadyTracked(id));
            }
            records.insert(
                id,
                LocationRecord {
                    id,
                    is_aggregate: aggregate,
                    provenance: Provenance::Local,
                    location,
                    orientation,
                    bounds,
                    mesh: mesh.clone(),
                    physics: physics.clone(),
                    query_data: query_data.clone(),
                },
            );
        }

        debug!("📍 Local object {} added (aggregate={})", id, aggregate);
        for entry in self.snapshot().await {
            if !aggregate || entry.want_aggregates {
                entry
                    .listener
                    .local_object_added(
                        id,
                        aggregate,
                        location,
                        orientation,
                        bounds,
                        &mesh,
                        &physics,
                        &query_data,
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Removes a local record.
    ///
    /// `on_removed` is invoked exactly once, after every interested
    /// listener has acknowledged its own removal handling, or immediately
    /// if no listener is interested.
    pub async fn remove_local_object(
        &self,
        id: EntityId,
        on_removed: RemovalCallback,
    ) -> Result<(), LocationError> {
        let aggregate = {
            let mut records = self.records.write().await;
            let record = records.get(&id).ok_or(LocationError::NotTracked(id))?;
            if record.provenance != Provenance::Local {
                return Err(LocationError::ProvenanceConflict {
                    entity: id,
                    expected: Provenance::Local.name(),
                    actual: record.provenance.name(),
                });
            }
            let aggregate = record.is_aggregate;
            records.remove(&id);
            aggregate
        };

        debug!("📍 Local object {} removed (aggregate={})", id, aggregate);
        let interested: Vec<ListenerEntry> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|e| !aggregate || e.want_aggregates)
            .collect();

        if interested.is_empty() {
            on_removed();
            return Ok(());
        }

        let completion = RemovalCompletion::new(interested.len(), on_removed);
        for entry in interested {
            entry
                .listener
                .local_object_removed(id, aggregate, completion.clone())
                .await;
        }
        Ok(())
    }

    async fn mutate_local<F>(&self, id: EntityId, apply: F) -> Result<bool, LocationError>
    where
        F: FnOnce(&mut LocationRecord),
    {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(LocationError::NotTracked(id))?;
        if record.provenance != Provenance::Local {
            return Err(LocationError::ProvenanceConflict {
                entity: id,
                expected: Provenance::Local.name(),
                actual: record.provenance.name(),
            });
        }
        apply(record);
        Ok(record.is_aggregate)
    }

    /// Updates a local object's motion and notifies listeners.
    pub async fn update_local_location(
        &self,
        id: EntityId,
        new_value: TimedMotionVector,
    ) -> Result<(), LocationError> {
        let aggregate = self.mutate_local(id, |r| r.location = new_value).await?;
        for entry in self.snapshot().await {
            if !aggregate || entry.want_aggregates {
                entry
                    .listener
                    .local_location_updated(id, aggregate, new_value)
                    .await;
            }
        }
        Ok(())
    }

    /// Updates a local object's rotational motion and notifies listeners.
    pub async fn update_local_orientation(
        &self,
        id: EntityId,
        new_value: TimedMotionQuaternion,
    ) -> Result<(), LocationError> {
        let aggregate = self.mutate_local(id, |r| r.orientation = new_value).await?;
        for entry in self.snapshot().await {
            if !aggregate || entry.want_aggregates {
                entry
                    .listener
                    .local_orientation_updated(id, aggregate, new_value)
                    .await;
            }
        }
        Ok(())
    }

    /// Updates a local object's bounding volume and notifies listeners.
    pub async fn update_local_bounds(
        &self,
        id: EntityId,
        new_value: AggregateBounds,
    ) -> Result<(), LocationError> {
        let aggregate = self.mutate_local(id, |r| r.bounds = new_value).await?;
        for entry in self.snapshot().await {
            if !aggregate || entry.want_aggregates {
                entry
                    .listener
                    .local_bounds_updated(id, aggregate, new_value)
                    .await;
            }
        }
        Ok(())
    }

    /// Updates a local object's mesh reference and notifies listeners.
    pub async fn update_local_mesh(
        &self,
        id: EntityId,
        new_value: String,
    ) -> Result<(), LocationError> {
        let aggregate = self
            .mutate_local(id, |r| r.mesh = new_value.clone())
            .await?;
        for entry in self.snapshot().await {
            if !aggregate || entry.want_aggregates {
                entry
                    .listener
                    .local_mesh_updated(id, aggregate, &new_value)
                    .await;
            }
        }
        Ok(())
    }

    /// Updates a local object's physics metadata and notifies listeners.
    pub async fn update_local_physics(
        &self,
        id: EntityId,
        new_value: String,
    ) -> Result<(), LocationError> {
        let aggregate = self
            .mutate_local(id, |r| r.physics = new_value.clone())
            .await?;
        for entry in self.snapshot().await {
            if !aggregate || entry.want_aggregates {
                entry
                    .listener
                    .local_physics_updated(id, aggregate, &new_value)
                    .await;
            }
        }
        Ok(())
    }

    /// Updates a local object's query data and notifies listeners.
    pub async fn update_local_query_data(
        &self,
        id: EntityId,
        new_value: String,
    ) -> Result<(), LocationError> {
        let aggregate = self
            .mutate_local(id, |r| r.query_data = new_value.clone())
            .await?;
        for entry in self.snapshot().await {
            if !aggregate || entry.want_aggregates {
                entry
                    .listener
                    .local_query_data_updated(id, aggregate, &new_value)
                    .await;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Replica lifecycle
    // ------------------------------------------------------------------
    //
    // Replica notifications are always delivered to every listener:
    // aggregation is meaningless for a replica view, so `want_aggregates`
    // does not filter here.

    /// Creates a replica record mirroring another node's entity.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_replica_object(
        &self,
        id: EntityId,
        location: TimedMotionVector,
        orientation: TimedMotionQuaternion,
        bounds: AggregateBounds,
        mesh: String,
        physics: String,
        query_data: String,
    ) -> Result<(), LocationError> {
        {
            let mut records = self.records.write().await;
            if records.contains_key(&id) {
                return Err(LocationError::AlreadyTracked(id));
            }
            records.insert(
                id,
                LocationRecord {
                    id,
                    is_aggregate: false,
                    provenance: Provenance::Replica,
                    location,
                    orientation,
                    bounds,
                    mesh: mesh.clone(),
                    physics: physics.clone(),
                    query_data: query_data.clone(),
                },
            );
        }

        debug!("🪞 Replica object {} added", id);
        for entry in self.snapshot().await {
            entry
                .listener
                .replica_object_added(
                    id,
                    location,
                    orientation,
                    bounds,
                    &mesh,
                    &physics,
                    &query_data,
                )
                .await;
        }
        Ok(())
    }

    /// Invalidates a replica record.
    pub async fn remove_replica_object(&self, id: EntityId) -> Result<(), LocationError> {
        {
            let mut records = self.records.write().await;
            let record = records.get(&id).ok_or(LocationError::NotTracked(id))?;
            if record.provenance != Provenance::Replica {
                return Err(LocationError::ProvenanceConflict {
                    entity: id,
                    expected: Provenance::Replica.name(),
                    actual: record.provenance.name(),
                });
            }
            records.remove(&id);
        }

        debug!("🪞 Replica object {} removed", id);
        for entry in self.snapshot().await {
            entry.listener.replica_object_removed(id).await;
        }
        Ok(())
    }

    async fn mutate_replica<F>(&self, id: EntityId, apply: F) -> Result<(), LocationError>
    where
        F: FnOnce(&mut LocationRecord),
    {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(LocationError::NotTracked(id))?;
        if record.provenance != Provenance::Replica {
            return Err(LocationError::ProvenanceConflict {
                entity: id,
                expected: Provenance::Replica.name(),
                actual: record.provenance.name(),
            });
        }
        apply(record);
        Ok(())
    }

    /// Refreshes a replica's motion from its authoritative node.
    pub async fn update_replica_location(
        &self,
        id: EntityId,
        new_value: TimedMotionVector,
    ) -> Result<(), LocationError> {
        self.mutate_replica(id, |r| r.location = new_value).await?;
        for entry in self.snapshot().await {
            entry.listener.replica_location_updated(id, new_value).await;
        }
        Ok(())
    }

    /// Refreshes a replica's rotational motion.
    pub async fn update_replica_orientation(
        &self,
        id: EntityId,
        new_value: TimedMotionQuaternion,
    ) -> Result<(), LocationError> {
        self.mutate_replica(id, |r| r.orientation = new_value)
            .await?;
        for entry in self.snapshot().await {
            entry
                .listener
                .replica_orientation_updated(id, new_value)
                .await;
        }
        Ok(())
    }

    /// Refreshes a replica's bounding volume.
    pub async fn update_replica_bounds(
        &self,
        id: EntityId,
        new_value: AggregateBounds,
    ) -> Result<(), LocationError> {
        self.mutate_replica(id, |r| r.bounds = new_value).await?;
        for entry in self.snapshot().await {
            entry.listener.replica_bounds_updated(id, new_value).await;
        }
        Ok(())
    }

    /// Refreshes a replica's mesh reference.
    pub async fn update_replica_mesh(
        &self,
        id: EntityId,
        new_value: String,
    ) -> Result<(), LocationError> {
        self.mutate_replica(id, |r| r.mesh = new_value.clone())
            .await?;
        for entry in self.snapshot().await {
            entry.listener.replica_mesh_updated(id, &new_value).await;
        }
        Ok(())
    }

    /// Refreshes a replica's physics metadata.
    pub async fn update_replica_physics(
        &self,
        id: EntityId,
        new_value: String,
    ) -> Result<(), LocationError> {
        self.mutate_replica(id, |r| r.physics = new_value.clone())
            .await?;
        for entry in self.snapshot().await {
            entry.listener.replica_physics_updated(id, &new_value).await;
        }
        Ok(())
    }

    /// Refreshes a replica's query data.
    pub async fn update_replica_query_data(
        &self,
        id: EntityId,
        new_value: String,
    ) -> Result<(), LocationError> {
        self.mutate_replica(id, |r| r.query_data = new_value.clone())
            .await?;
        for entry in self.snapshot().await {
            entry
                .listener
                .replica_query_data_updated(id, &new_value)
                .await;
        }
        Ok(())
    }

    /// Applies one entry of an inter-node update batch to this node's
    /// replica view, creating the replica record on first sight.
    pub async fn apply_replica_update(
        &self,
        object: EntityId,
        location: TimedMotionVector,
    ) -> Result<(), LocationError> {
        let known = {
            let records = self.records.read().await;
            records.get(&object).map(|r| r.provenance)
        };

        match known {
            None => {
                self.add_replica_object(
                    object,
                    location,
                    TimedMotionQuaternion::default(),
                    AggregateBounds::default(),
                    String::new(),
                    String::new(),
                    String::new(),
                )
                .await
            }
            Some(Provenance::Replica) => self.update_replica_location(object, location).await,
            Some(Provenance::Local) => Err(LocationError::ProvenanceConflict {
                entity: object,
                expected: Provenance::Replica.name(),
                actual: Provenance::Local.name(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Inter-node updates
    // ------------------------------------------------------------------

    /// Delivers a raw inter-node update batch to every listener for
    /// server-level handling (forwarding, merging).
    pub async fn notify_location_update_from_server(
        &self,
        node: NodeId,
        update: &BulkLocationUpdate,
    ) {
        for entry in self.snapshot().await {
            entry.listener.location_update_from_server(node, update).await;
        }
    }

    // ------------------------------------------------------------------
    // Subscription delegation
    // ------------------------------------------------------------------

    /// Subscribes `remote` to updates for `entity` via the bound policy.
    pub async fn subscribe(
        &self,
        remote: RemoteId,
        entity: EntityId,
        seqno: Option<SeqNoHandle>,
    ) {
        if let Some(policy) = self.update_policy.read().await.clone() {
            policy.subscribe(remote, entity, seqno).await;
        }
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
        if let Some(policy) = self.update_policy.read().await.clone() {
            policy
                .subscribe_indexed(remote, entity, index_id, seqno)
                .await;
        }
    }

    /// Removes `remote`'s subscription for `entity`.
    pub async fn unsubscribe(&self, remote: RemoteId, entity: EntityId) {
        if let Some(policy) = self.update_policy.read().await.clone() {
            policy.unsubscribe(remote, entity).await;
        }
    }

    /// Removes `remote`'s subscription for `entity` under one query index.
    pub async fn unsubscribe_indexed(&self, remote: RemoteId, entity: EntityId, index_id: u32) {
        if let Some(policy) = self.update_policy.read().await.clone() {
            policy.unsubscribe_indexed(remote, entity, index_id).await;
        }
    }

    /// Tears down every subscription held by `remote`, then invokes
    /// `on_complete`.
    pub async fn unsubscribe_all(&self, remote: RemoteId, on_complete: UnsubscribeCallback) {
        match self.update_policy.read().await.clone() {
            Some(policy) => policy.unsubscribe_all(remote, on_complete).await,
            None => on_complete(),
        }
    }
}

impl Default for LocationService {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vec3;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct RecordingListener {
        location_updates: AsyncMutex<Vec<EntityId>>,
        replica_updates: AsyncMutex<Vec<EntityId>>,
    }

    #[async_trait]
    impl LocationListener for RecordingListener {
        async fn local_location_updated(
            &self,
            id: EntityId,
            _aggregate: bool,
            _new_value: TimedMotionVector,
        ) {
            self.location_updates.lock().await.push(id);
        }

        async fn replica_location_updated(&self, id: EntityId, _new_value: TimedMotionVector) {
            self.replica_updates.lock().await.push(id);
        }
    }

    /// Listener that acknowledges removals from a spawned task, simulating
    /// asynchronous cleanup.
    struct AsyncRemovalListener {
        delay: Duration,
    }

    #[async_trait]
    impl LocationListener for AsyncRemovalListener {
        async fn local_object_removed(
            &self,
            _id: EntityId,
            _aggregate: bool,
            completion: RemovalCompletion,
        ) {
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                completion.complete();
            });
        }
    }

    async fn add_leaf(service: &LocationService, id: EntityId, aggregate: bool) {
        service
            .add_local_object(
                id,
                aggregate,
                TimedMotionVector::stationary(crate::types::SimTime::ZERO, Vec3::zero()),
                TimedMotionQuaternion::default(),
                AggregateBounds::single(1.0),
                String::new(),
                String::new(),
                String::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_aggregate_updates_filter_listeners() {
        let service = LocationService::new();
        let wants = Arc::new(RecordingListener::default());
        let skips = Arc::new(RecordingListener::default());
        service
            .add_listener(wants.clone() as Arc<dyn LocationListener>, true)
            .await;
        service
            .add_listener(skips.clone() as Arc<dyn LocationListener>, false)
            .await;

        let agg = EntityId::new();
        add_leaf(&service, agg, true).await;
        service
            .update_local_location(
                agg,
                TimedMotionVector::stationary(
                    crate::types::SimTime::from_seconds(1.0),
                    Vec3::new(1.0, 0.0, 0.0),
                ),
            )
            .await
            .unwrap();

        assert_eq!(wants.location_updates.lock().await.len(), 1);
        assert!(skips.location_updates.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_replica_updates_reach_all_listeners() {
        let service = LocationService::new();
        let skips_aggregates = Arc::new(RecordingListener::default());
        service
            .add_listener(skips_aggregates.clone() as Arc<dyn LocationListener>, false)
            .await;

        let id = EntityId::new();
        service
            .add_replica_object(
                id,
                TimedMotionVector::default(),
                TimedMotionQuaternion::default(),
                AggregateBounds::default(),
                String::new(),
                String::new(),
                String::new(),
            )
            .await
            .unwrap();
        service
            .update_replica_location(id, TimedMotionVector::default())
            .await
            .unwrap();

        // The aggregate filter never applies to replica traffic.
        assert_eq!(skips_aggregates.replica_updates.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_removal_with_no_listeners_completes_immediately() {
        let service = LocationService::new();
        let id = EntityId::new();
        add_leaf(&service, id, false).await;

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        service
            .remove_local_object(
                id,
                Box::new(move || {
                    fired_clone.store(true, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        assert!(fired.load(Ordering::SeqCst));
        assert!(!service.contains(id).await);
    }

    #[tokio::test]
    async fn test_removal_completion_counts_listeners() {
        for listener_count in [1usize, 3] {
            let service = LocationService::new();
            for i in 0..listener_count {
                service
                    .add_listener(
                        Arc::new(AsyncRemovalListener {
                            delay: Duration::from_millis(10 * (i as u64 + 1)),
                        }) as Arc<dyn LocationListener>,
                        true,
                    )
                    .await;
            }

            let id = EntityId::new();
            add_leaf(&service, id, false).await;

            let fired = Arc::new(AtomicUsize::new(0));
            let fired_clone = fired.clone();
            service
                .remove_local_object(
                    id,
                    Box::new(move || {
                        fired_clone.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .await
                .unwrap();

            // Callback must not fire until every asynchronous listener
            // acknowledgment has landed.
            assert_eq!(fired.load(Ordering::SeqCst), 0);
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_provenance_transitions_require_absent_state() {
        let service = LocationService::new();
        let id = EntityId::new();
        add_leaf(&service, id, false).await;

        // A second add of any provenance is rejected.
        let err = service
            .add_replica_object(
                id,
                TimedMotionVector::default(),
                TimedMotionQuaternion::default(),
                AggregateBounds::default(),
                String::new(),
                String::new(),
                String::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LocationError::AlreadyTracked(_)));

        // Replica operations on a local record are provenance conflicts.
        let err = service.remove_replica_object(id).await.unwrap_err();
        assert!(matches!(err, LocationError::ProvenanceConflict { .. }));

        // After a full removal the entity may re-enter as a replica.
        service.remove_local_object(id, Box::new(|| {})).await.unwrap();
        service
            .add_replica_object(
                id,
                TimedMotionVector::default(),
                TimedMotionQuaternion::default(),
                AggregateBounds::default(),
                String::new(),
                String::new(),
                String::new(),
            )
            .await
            .unwrap();
        assert_eq!(service.provenance(id).await, Some(Provenance::Replica));
    }

    #[tokio::test]
    async fn test_listener_may_unregister_itself_mid_notification() {
        struct SelfRemovingListener {
            service: Arc<LocationService>,
            me: AsyncMutex<Option<Arc<dyn LocationListener>>>,
        }

        #[async_trait]
        impl LocationListener for SelfRemovingListener {
            async fn local_location_updated(
                &self,
                _id: EntityId,
                _aggregate: bool,
                _new_value: TimedMotionVector,
            ) {
                if let Some(me) = self.me.lock().await.take() {
                    self.service.remove_listener(&me).await;
                }
            }
        }

        let service = Arc::new(LocationService::new());
        let tail = Arc::new(RecordingListener::default());

        let self_removing = Arc::new(SelfRemovingListener {
            service: service.clone(),
            me: AsyncMutex::new(None),
        });
        let as_dyn: Arc<dyn LocationListener> = self_removing.clone();
        *self_removing.me.lock().await = Some(as_dyn.clone());

        service.add_listener(as_dyn, true).await;
        service
            .add_listener(tail.clone() as Arc<dyn LocationListener>, true)
            .await;

        let id = EntityId::new();
        add_leaf(&service, id, false).await;
        service
            .update_local_location(id, TimedMotionVector::default())
            .await
            .unwrap();

        // The snapshot keeps the in-progress fan-out intact: the tail
        // listener still hears the update that removed its predecessor.
        assert_eq!(tail.location_updates.lock().await.len(), 1);
        assert_eq!(service.listener_count().await, 1);
    }
}
