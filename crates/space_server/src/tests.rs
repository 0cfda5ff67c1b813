//! Cross-component integration tests: two nodes (or a node and an object)
//! talking over the in-memory link fabric.

use crate::auth::{AllowAllAuthenticator, TicketAuthenticator};
use crate::config::ServerConfig;
use crate::server::{SpaceServer, TransportBinding};
use crate::session::SessionKind;
use crate::stream::{Endpoint, InMemoryNetwork, SessionStreamLayer, SESSION_STREAM_PORT, STREAM_OK};
use meridian_location_system::{
    EntityId, LocationUpdatePolicy, LocationUpdateRequest, NodeId, Provenance, ProximityAddition,
    ProximityResults, RemoteId, SimTime, TimedMotionVector, Vec3, PORT_LOCATION, PORT_PROXIMITY,
};
use std::sync::Arc;
use std::time::Duration;

fn test_config(node_id: u32) -> ServerConfig {
    ServerConfig {
        node_id,
        retry_interval_ms: 50,
        ..ServerConfig::default()
    }
}

async fn start_node(network: &Arc<InMemoryNetwork>, node_id: u32) -> Arc<SpaceServer> {
    let server = SpaceServer::new(
        test_config(node_id),
        network.clone(),
        Arc::new(AllowAllAuthenticator),
        Arc::new(LocationUpdatePolicy::new()),
    )
    .await;
    server
        .start(TransportBinding::InMemory(network.clone()))
        .await
        .unwrap();
    server
}

async fn add_stationary_object(server: &SpaceServer, entity: EntityId) {
    server
        .location()
        .add_local_object(
            entity,
            false,
            TimedMotionVector::stationary(SimTime::ZERO, Vec3::zero()),
            Default::default(),
            Default::default(),
            String::new(),
            String::new(),
            String::new(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_round_trip_update_produces_equal_replica() {
    let network = InMemoryNetwork::new();
    let server_a = start_node(&network, 1).await;
    let server_b = start_node(&network, 2).await;

    let entity = EntityId::new();
    add_stationary_object(&server_a, entity).await;
    server_a
        .policy()
        .subscribe(RemoteId::ClusterNode(NodeId(2)), entity, None)
        .await;

    // Below the divergence threshold nothing is transmitted.
    let crawl = TimedMotionVector::stationary(SimTime::from_seconds(0.5), Vec3::new(1.0, 0.0, 0.0));
    assert!(!server_a
        .report_local_motion(entity, SimTime::from_seconds(0.5), crawl)
        .await
        .unwrap());

    // Past the threshold the update is broadcast, serialized, shipped to
    // the subscribed node, decoded there, and applied as a replica.
    let moved = TimedMotionVector::new(
        SimTime::from_seconds(1.0),
        Vec3::new(10.0, 2.0, -3.0),
        Vec3::new(1.0, 0.0, 0.0),
    );
    assert!(server_a
        .report_local_motion(entity, SimTime::from_seconds(1.0), moved)
        .await
        .unwrap());

    let mut replicated = None;
    for _ in 0..200 {
        if let Some(record) = server_b.location().record(entity).await {
            replicated = Some(record);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let record = replicated.expect("update never reached node 2");

    assert_eq!(record.provenance, Provenance::Replica);
    assert_eq!(record.location.position, moved.position);
    assert_eq!(record.location.velocity, moved.velocity);

    // The origin record stayed authoritative on node 1.
    assert_eq!(
        server_a.location().provenance(entity).await,
        Some(Provenance::Local)
    );

    server_a.stop().await;
    server_b.stop().await;
}

#[tokio::test]
async fn test_object_session_announcement_becomes_local_state() {
    let network = InMemoryNetwork::new();
    let server = start_node(&network, 3).await;
    let node_entity = server.node_entity();

    // A standalone object dials the node through its own stream layer.
    let object = EntityId::new();
    let object_layer = SessionStreamLayer::new(network.clone());
    let (tx, rx) = tokio::sync::oneshot::channel();
    object_layer
        .connect_stream(
            Endpoint::new(object, SESSION_STREAM_PORT),
            Endpoint::new(node_entity, SESSION_STREAM_PORT),
            Box::new(move |err, stream| {
                let _ = tx.send((err, stream));
            }),
        )
        .await;
    let (err, object_stream) = rx.await.unwrap();
    assert_eq!(err, STREAM_OK);
    let object_stream = object_stream.unwrap();

    // Wait for the node side to cache the inbound stream, then promote it
    // to an authenticated session.
    let mut node_side = None;
    for _ in 0..200 {
        if let Some(stream) = server.messaging().get_stream(node_entity, object).await {
            node_side = Some(stream);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    server
        .accept_session(object, SessionKind::Object, b"", node_side.unwrap())
        .await
        .unwrap();

    // The object announces its motion on the location port.
    let announced = LocationUpdateRequest {
        location: TimedMotionVector::new(
            SimTime::from_seconds(2.0),
            Vec3::new(5.0, 6.0, 7.0),
            Vec3::zero(),
        ),
    };
    let (open_tx, open_rx) = tokio::sync::oneshot::channel();
    object_stream
        .create_child_stream(
            Box::new(move |err, substream| {
                let _ = open_tx.send((err, substream.is_some()));
            }),
            Some(announced.encode().unwrap()),
            PORT_LOCATION,
        )
        .await;
    let (err, opened) = open_rx.await.unwrap();
    assert_eq!(err, STREAM_OK);
    assert!(opened);

    let mut admitted = None;
    for _ in 0..200 {
        if let Some(record) = server.location().record(object).await {
            admitted = Some(record);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let record = admitted.expect("announcement never applied");
    assert_eq!(record.provenance, Provenance::Local);
    assert_eq!(record.location.position, Vec3::new(5.0, 6.0, 7.0));

    // Ending the session retires the object's record.
    server.sessions().end_session(object).await;
    let mut retired = false;
    for _ in 0..200 {
        if !server.location().contains(object).await {
            retired = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(retired, "departed object still tracked");

    server.stop().await;
}

#[tokio::test]
async fn test_proximity_results_ride_the_datagram_channel() {
    let network = InMemoryNetwork::new();
    let server = start_node(&network, 4).await;
    let node_entity = server.node_entity();

    let object = EntityId::new();
    let object_layer = SessionStreamLayer::new(network.clone());
    let (tx, rx) = tokio::sync::oneshot::channel();
    object_layer
        .connect_stream(
            Endpoint::new(object, SESSION_STREAM_PORT),
            Endpoint::new(node_entity, SESSION_STREAM_PORT),
            Box::new(move |err, stream| {
                let _ = tx.send((err, stream));
            }),
        )
        .await;
    let (_, object_stream) = rx.await.unwrap();
    let object_stream = object_stream.unwrap();

    // The object listens for proximity datagrams on its side.
    let (dg_tx, mut dg_rx) = tokio::sync::mpsc::unbounded_channel();
    object_stream
        .connection()
        .unwrap()
        .register_read_datagram_callback(
            PORT_PROXIMITY,
            Box::new(move |bytes| {
                let _ = dg_tx.send(bytes.to_vec());
            }),
        );

    let mut node_side = None;
    for _ in 0..200 {
        if let Some(stream) = server.messaging().get_stream(node_entity, object).await {
            node_side = Some(stream);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    server
        .accept_session(object, SessionKind::Object, b"", node_side.unwrap())
        .await
        .unwrap();

    let nearby = EntityId::new();
    let results = ProximityResults {
        addition: vec![ProximityAddition {
            object: nearby,
            location: TimedMotionVector::stationary(SimTime::ZERO, Vec3::new(1.0, 1.0, 1.0)),
        }],
        removal: Vec::new(),
    };
    server.send_proximity_results(object, &results).await.unwrap();

    let raw = dg_rx.recv().await.unwrap();
    let decoded = ProximityResults::decode(&raw).unwrap();
    assert_eq!(decoded.addition.len(), 1);
    assert_eq!(decoded.addition[0].object, nearby);

    server.stop().await;
}

#[tokio::test]
async fn test_unauthenticated_session_never_replicates() {
    let network = InMemoryNetwork::new();
    let auth = Arc::new(TicketAuthenticator::new());
    auth.issue("valid-ticket").await;

    let server = SpaceServer::new(
        test_config(5),
        network.clone(),
        auth,
        Arc::new(LocationUpdatePolicy::new()),
    )
    .await;
    server
        .start(TransportBinding::InMemory(network.clone()))
        .await
        .unwrap();
    let node_entity = server.node_entity();

    let object = EntityId::new();
    let object_layer = SessionStreamLayer::new(network.clone());
    let (tx, rx) = tokio::sync::oneshot::channel();
    object_layer
        .connect_stream(
            Endpoint::new(object, SESSION_STREAM_PORT),
            Endpoint::new(node_entity, SESSION_STREAM_PORT),
            Box::new(move |err, stream| {
                let _ = tx.send((err, stream));
            }),
        )
        .await;
    let (_, object_stream) = rx.await.unwrap();
    let _object_stream = object_stream.unwrap();

    let mut node_side = None;
    for _ in 0..200 {
        if let Some(stream) = server.messaging().get_stream(node_entity, object).await {
            node_side = Some(stream);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let result = server
        .accept_session(
            object,
            SessionKind::Object,
            b"stolen-ticket",
            node_side.unwrap(),
        )
        .await;
    assert!(result.is_err());
    assert_eq!(server.sessions().session_count().await, 0);

    // The real ticket still works exactly once.
    let (tx, rx) = tokio::sync::oneshot::channel();
    object_layer
        .connect_stream(
            Endpoint::new(object, SESSION_STREAM_PORT),
            Endpoint::new(node_entity, SESSION_STREAM_PORT),
            Box::new(move |err, stream| {
                let _ = tx.send((err, stream));
            }),
        )
        .await;
    rx.await.unwrap();
    let mut node_side = None;
    for _ in 0..200 {
        match server.messaging().get_stream(node_entity, object).await {
            Some(stream) if !stream.connection().map(|c| c.is_closed()).unwrap_or(true) => {
                node_side = Some(stream);
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    server
        .accept_session(
            object,
            SessionKind::Object,
            b"valid-ticket",
            node_side.unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(server.sessions().session_count().await, 1);

    server.stop().await;
}
