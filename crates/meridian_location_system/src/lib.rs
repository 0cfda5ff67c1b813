//! # Meridian Location System
//!
//! Location/proximity synchronization core for a clustered virtual-world
//! server. This crate keeps every participant (other cluster nodes,
//! external object hosts, and individual simulated objects) informed of a
//! moving entity's position, orientation, bounding volume, mesh, and physics
//! metadata, while minimizing the number of update messages sent over the
//! network.
//!
//! ## Components
//!
//! - [`LocationService`] - the authoritative per-entity state store with the
//!   local/replica/aggregate distinction, plus the listener registry that
//!   fans out change notifications in registration order.
//! - [`MaxDistExtrapolator`] - the motion-extrapolation predicate that
//!   decides *when* a fresh update must be transmitted.
//! - [`LocationUpdatePolicy`] - subscription bookkeeping for the three
//!   remote address spaces (cluster node, object host, object), with shared
//!   per-subscription sequence counters for drop/reorder detection.
//! - [`protocol`] - the batch payload shapes carried opaquely between nodes.
//! - [`ServiceRegistry`] - explicit constructor registry for pluggable
//!   implementations, owned by process configuration rather than global
//!   state.
//!
//! ## Control flow
//!
//! When an entity's true motion changes, the extrapolation predicate is
//! consulted first. Past the divergence threshold, the location service
//! updates its record and notifies listeners; the update policy (itself a
//! listener) names the subscribed remotes, and the transmission layer in
//! `space_server` serializes a batch onto the appropriate session stream.
//!
//! ## Concurrency
//!
//! Service state lives behind `Arc<RwLock<..>>` and all APIs are async.
//! Listener fan-out iterates a defensive snapshot, so listeners may
//! unregister themselves from inside their own callbacks.

pub mod error;
pub mod location;
pub mod motion;
pub mod protocol;
pub mod registry;
pub mod subscription;
pub mod types;

pub use error::LocationError;
pub use location::{
    LocationListener, LocationRecord, LocationService, Provenance, RemovalCallback,
    RemovalCompletion, UnsubscribeCallback,
};
pub use motion::{MaxDistExtrapolator, DEFAULT_MAX_DIST};
pub use protocol::{
    BulkLocationUpdate, LocationUpdateEntry, LocationUpdateRequest, ProximityAddition,
    ProximityRemoval, ProximityResults, PORT_LOCATION, PORT_PROXIMITY, PORT_SCRIPT_COMM,
};
pub use registry::ServiceRegistry;
pub use subscription::{next_seqno, LocationUpdatePolicy, PolicyStats, SeqNoHandle};
pub use types::{
    AggregateBounds, EntityId, NodeId, ObjectHostId, Quat, RemoteId, SimTime,
    TimedMotionQuaternion, TimedMotionVector, Vec3, NULL_NODE_ID,
};

use std::sync::Arc;

/// Creates a location service with a freshly initialized standard update
/// policy bound to it.
pub async fn create_location_service() -> (Arc<LocationService>, Arc<LocationUpdatePolicy>) {
    let service = Arc::new(LocationService::new());
    let policy = Arc::new(LocationUpdatePolicy::new());
    policy.initialize(&service).await;
    (service, policy)
}
