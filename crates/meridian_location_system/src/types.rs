//! # Core Type Definitions
//!
//! Fundamental types used throughout the Meridian location system: typed
//! identifiers for the three subscription address spaces, simulation time,
//! and the timestamped motion primitives every location record carries.
//!
//! ## Key Types
//!
//! - [`EntityId`] - Unique identifier for simulated entities (leaf or aggregate)
//! - [`NodeId`] - Identifier for a cluster node (space server)
//! - [`ObjectHostId`] - Identifier for an external object-host node
//! - [`RemoteId`] - Tagged union over the three address spaces
//! - [`SimTime`] - Microsecond-resolution simulation timestamp
//! - [`TimedMotionVector`] - Position + velocity sampled at a point in time
//!
//! ## Design Principles
//!
//! - **Type Safety**: Wrapper types prevent ID confusion across address spaces
//! - **Precision**: Double-precision floats for accurate large-world positioning
//! - **Serialization**: All types support JSON serialization for network transmission

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for an entity in the world.
///
/// This is a wrapper around UUID that provides type safety and ensures
/// entity IDs cannot be confused with other identifier kinds. Both leaf
/// entities and aggregates are addressed with an `EntityId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    /// Creates a new random entity ID using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an entity ID from a string representation.
    pub fn from_str(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    /// Deterministic transport identity for a cluster node.
    ///
    /// Cluster nodes are addressed by [`NodeId`] at the subscription layer but
    /// by `EntityId` at the stream layer; this maps one to the other stably so
    /// every node in the cluster derives the same endpoint identity.
    pub fn for_node(node: NodeId) -> Self {
        Self(Uuid::from_u128((node.0 as u128) << 96))
    }

    /// Inverse of [`for_node`](Self::for_node): the node identity embedded in
    /// a transport entity, if this ID was derived from one.
    pub fn as_node(&self) -> Option<NodeId> {
        let raw = self.0.as_u128();
        let node = (raw >> 96) as u32;
        if node != 0 && raw == (node as u128) << 96 {
            Some(NodeId(node))
        } else {
            None
        }
    }
}

impl std::str::FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a cluster node (space server).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// The null node ID, used before a node identity has been assigned.
pub const NULL_NODE_ID: NodeId = NodeId(0);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Identifier for an external object-host node.
///
/// Object hosts run outside the cluster and hold the authoritative scripts
/// for the objects they connect; they subscribe to location updates through
/// their own address space, distinct from cluster nodes and leaf objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHostId(pub Uuid);

impl ObjectHostId {
    /// Creates a new random object-host ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObjectHostId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObjectHostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "oh-{}", self.0)
    }
}

/// The three address spaces that can subscribe to location updates.
///
/// A subscription is always owned by exactly one remote identity: another
/// cluster node, an external object host, or an individual object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteId {
    /// Another space server in the cluster.
    ClusterNode(NodeId),
    /// An external object-host node.
    ObjectHost(ObjectHostId),
    /// An individual object.
    Object(EntityId),
}

impl std::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteId::ClusterNode(id) => write!(f, "{id}"),
            RemoteId::ObjectHost(id) => write!(f, "{id}"),
            RemoteId::Object(id) => write!(f, "obj-{id}"),
        }
    }
}

// ============================================================================
// Simulation time
// ============================================================================

/// A simulation timestamp with microsecond resolution.
///
/// All motion samples are stamped with `SimTime` so they can be extrapolated
/// to any later point. The epoch is the simulation start, not the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SimTime(u64);

impl SimTime {
    /// The simulation epoch.
    pub const ZERO: SimTime = SimTime(0);

    /// Creates a timestamp from microseconds since the simulation epoch.
    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Creates a timestamp from (fractional) seconds since the simulation epoch.
    pub fn from_seconds(secs: f64) -> Self {
        Self((secs.max(0.0) * 1_000_000.0) as u64)
    }

    /// Microseconds since the simulation epoch.
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Seconds elapsed since `earlier`, saturating to zero for timestamps
    /// that are not actually earlier.
    pub fn seconds_since(&self, earlier: SimTime) -> f64 {
        self.0.saturating_sub(earlier.0) as f64 / 1_000_000.0
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}us", self.0)
    }
}

// ============================================================================
// Spatial primitives
// ============================================================================

/// A 3D vector with double-precision components.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    /// X coordinate (typically east-west axis)
    pub x: f64,
    /// Y coordinate (typically vertical axis)
    pub y: f64,
    /// Z coordinate (typically north-south axis)
    pub z: f64,
}

impl Vec3 {
    /// Creates a new vector with the specified components.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Creates a zero vector (0, 0, 0).
    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// Calculates the Euclidean distance to another vector.
    pub fn distance(&self, other: Vec3) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Vector length.
    pub fn length(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// A rotation quaternion.
///
/// Stored unnormalized; consumers that need a unit quaternion normalize at
/// the point of use. Angular velocity is represented as a quaternion as well
/// so orientation and its rate of change share one wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    /// Scalar component.
    pub w: f64,
    /// X component of the vector part.
    pub x: f64,
    /// Y component of the vector part.
    pub y: f64,
    /// Z component of the vector part.
    pub z: f64,
}

impl Quat {
    /// Creates a quaternion from components.
    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    /// The identity rotation.
    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::identity()
    }
}

// ============================================================================
// Timestamped motion
// ============================================================================

/// A motion vector sampled at a point in simulation time.
///
/// Supports extrapolation to any later time under a constant-velocity model,
/// which is the contract the motion-extrapolation predicate evaluates
/// against.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimedMotionVector {
    /// Sample timestamp.
    pub time: SimTime,
    /// Position at `time`.
    pub position: Vec3,
    /// Velocity at `time`, in units per second.
    pub velocity: Vec3,
}

impl TimedMotionVector {
    /// Creates a motion sample.
    pub fn new(time: SimTime, position: Vec3, velocity: Vec3) -> Self {
        Self {
            time,
            position,
            velocity,
        }
    }

    /// A stationary sample at `position`.
    pub fn stationary(time: SimTime, position: Vec3) -> Self {
        Self::new(time, position, Vec3::zero())
    }

    /// Extrapolates the position to time `t` under constant velocity.
    ///
    /// Times earlier than the sample time clamp to the sample position.
    pub fn extrapolate(&self, t: SimTime) -> Vec3 {
        let dt = t.seconds_since(self.time);
        Vec3::new(
            self.position.x + self.velocity.x * dt,
            self.position.y + self.velocity.y * dt,
            self.position.z + self.velocity.z * dt,
        )
    }
}

/// A rotational motion sample: orientation plus angular velocity at a
/// point in simulation time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimedMotionQuaternion {
    /// Sample timestamp.
    pub time: SimTime,
    /// Orientation at `time`.
    pub orientation: Quat,
    /// Angular velocity at `time`.
    pub angular_velocity: Quat,
}

impl TimedMotionQuaternion {
    /// Creates a rotational motion sample.
    pub fn new(time: SimTime, orientation: Quat, angular_velocity: Quat) -> Self {
        Self {
            time,
            orientation,
            angular_velocity,
        }
    }

    /// A non-rotating sample holding `orientation`.
    pub fn fixed(time: SimTime, orientation: Quat) -> Self {
        Self::new(time, orientation, Quat::identity())
    }
}

impl Default for TimedMotionQuaternion {
    fn default() -> Self {
        Self::fixed(SimTime::ZERO, Quat::identity())
    }
}

/// Aggregate bounding volume descriptor.
///
/// For a leaf entity the center bounds collapse to a point and
/// `max_object_radius` is the entity's own bounding radius; for an aggregate
/// the center region covers the spread of member centers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateBounds {
    /// Offset of the bounds center from the entity position.
    pub center_offset: Vec3,
    /// Radius of the region containing member centers.
    pub center_radius: f64,
    /// Largest bounding radius of any member object.
    pub max_object_radius: f64,
}

impl AggregateBounds {
    /// Bounds for a single leaf object of the given radius.
    pub fn single(radius: f64) -> Self {
        Self {
            center_offset: Vec3::zero(),
            center_radius: 0.0,
            max_object_radius: radius,
        }
    }

    /// Conservative radius of the full volume.
    pub fn full_radius(&self) -> f64 {
        self.center_radius + self.max_object_radius
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extrapolate_constant_velocity() {
        let m = TimedMotionVector::new(
            SimTime::from_seconds(1.0),
            Vec3::new(10.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
        );

        let p = m.extrapolate(SimTime::from_seconds(3.0));
        assert!((p.x - 14.0).abs() < 1e-9);
        assert_eq!(p.y, 0.0);
    }

    #[test]
    fn test_extrapolate_clamps_earlier_times() {
        let m = TimedMotionVector::new(
            SimTime::from_seconds(5.0),
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::new(100.0, 0.0, 0.0),
        );

        let p = m.extrapolate(SimTime::from_seconds(2.0));
        assert_eq!(p, m.position);
    }

    #[test]
    fn test_node_endpoint_identity_is_stable() {
        let a = EntityId::for_node(NodeId(7));
        let b = EntityId::for_node(NodeId(7));
        assert_eq!(a, b);
        assert_ne!(a, EntityId::for_node(NodeId(8)));
    }

    #[test]
    fn test_aggregate_bounds_full_radius() {
        let bounds = AggregateBounds {
            center_offset: Vec3::zero(),
            center_radius: 10.0,
            max_object_radius: 2.5,
        };
        assert!((bounds.full_radius() - 12.5).abs() < 1e-9);
    }
}
