//! End-to-end scenarios: several engines exchanging one buffer over the
//! loopback fabric.

use std::{sync::Arc, time::Duration};

use super::test_utils::{n, spec, TestMesh, ROTATED_KEY, TEST_KEY};
use crate::{
    buffer_state::BufferPhase,
    config::MeshConfig,
    crypto_key::{KeyFlags, NONCE_LIMIT},
    error::{ExhaustionReason, MeshError},
    geometry::BufferGeometry,
    node::{NodeMask, Topology},
};

const MIB: u64 = 1 << 20;

fn config() -> MeshConfig {
    MeshConfig {
        wait_timeout_ms: 10_000,
        ..MeshConfig::default()
    }
}

fn assert_filled(bytes: &[u8], value: u8) {
    assert!(
        bytes.iter().all(|b| *b == value),
        "expected every byte to be {:#04x}",
        value
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_node_exchange() {
    let mesh = TestMesh::start(Topology::full(NodeMask::first_n(2)), 2, config());
    mesh.install_key(TEST_KEY);
    let geometry = BufferGeometry::for_buffer(4 * MIB, 2, MIB).unwrap();
    mesh.register(geometry, 1, 0).await;

    mesh.write_blocks(1, |rank| if rank == 0 { 0xFF } else { 0x11 });
    let participants = mesh.participants();
    for engine in &mesh.engines {
        engine.start_generation(1).await.unwrap();
    }
    let (g0, g1) = tokio::join!(
        mesh.engine(0).synchronize(participants),
        mesh.engine(1).synchronize(participants)
    );
    assert_eq!((g0.unwrap(), g1.unwrap()), (1, 1));

    let node1 = mesh.engine(1);
    let block0 = node1.read(1, 0, 2 * MIB).unwrap();
    assert_filled(&block0, 0xFF);
    let buffer = node1.buffer(1).unwrap();
    assert_eq!(buffer.inbound().len() + buffer.outbound().len(), 4);
    assert!(buffer.all_received());
    assert!(buffer.all_sent());
    assert_eq!(buffer.phase(), BufferPhase::Complete);

    let block1 = mesh.engine(0).read(1, 2 * MIB, 2 * MIB).unwrap();
    assert_filled(&block1, 0x11);

    let metrics = node1.metrics();
    assert_eq!(metrics.chunks_encrypted, 2);
    assert_eq!(metrics.chunks_decrypted, 2);
    assert_eq!(metrics.chunks_forwarded, 0);
    assert_eq!(node1.generations_completed(1), 1);
    mesh.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_line_topology_relays_through_middle_node() {
    let topology = Topology::from_links(&[(0, 1), (1, 2)]).unwrap();
    let mesh = TestMesh::start(topology, 3, config());
    mesh.install_key(TEST_KEY);
    let geometry = BufferGeometry::new(1, 3, 4096, 1024).unwrap();
    mesh.register(geometry, 7, 0).await;

    for round in 1..=3u8 {
        mesh.write_blocks(7, |rank| rank * 0x10 + round);
        let generation = mesh.run_generation(7).await.unwrap();
        assert_eq!(generation, round as u64);

        for (rank, engine) in mesh.engines.iter().enumerate() {
            for origin in 0..3u8 {
                let bytes = engine.read(7, origin as u64 * 4096, 4096).unwrap();
                assert_filled(&bytes, origin * 0x10 + round);
            }
            assert_eq!(engine.generations_completed(7), round as u64, "node {}", rank);
        }
    }

    // The middle node relays both ends' blocks: 4 chunks each, 3 generations.
    let relay = mesh.engine(1).metrics();
    assert_eq!(relay.chunks_forwarded, 2 * 4 * 3);
    assert_eq!(mesh.engine(0).metrics().chunks_forwarded, 0);
    let chains = mesh.engine(1).forwarder().chains_for(7);
    assert_eq!(chains.len(), 2);
    assert!(chains.iter().all(|c| c.generation() == 3));
    // Completions reach the forwarder after the buffer sees them.
    tokio::time::timeout(Duration::from_secs(2), async {
        while !chains.iter().all(|c| c.is_idle()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("forward chains did not drain");
    mesh.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_key_exhaustion_and_rotation() {
    let mesh = TestMesh::start(
        Topology::full(NodeMask::first_n(2)),
        2,
        MeshConfig {
            max_buffers_per_key: 2,
            ..config()
        },
    );
    mesh.install_key(TEST_KEY);
    let geometry = BufferGeometry::for_buffer(8192, 2, 1024).unwrap();
    mesh.register(geometry, 3, 0).await;
    mesh.write_blocks(3, |rank| rank + 1);

    mesh.run_generation(3).await.unwrap();
    mesh.run_generation(3).await.unwrap();
    for engine in &mesh.engines {
        let err = engine.start_generation(3).await.unwrap_err();
        assert!(matches!(
            err,
            MeshError::KeyExhausted {
                reason: ExhaustionReason::Buffers,
                ..
            }
        ));
        assert!(err.is_resource_exhausted());
        // The refused start leaves the buffer untouched.
        assert_eq!(engine.buffer(3).unwrap().generation(), 2);
    }

    mesh.install_key(ROTATED_KEY);
    mesh.write_blocks(3, |rank| rank + 9);
    assert_eq!(mesh.run_generation(3).await.unwrap(), 3);
    let bytes = mesh.engine(0).read(3, 4096, 4096).unwrap();
    assert_filled(&bytes, 10);
    mesh.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nonce_exhaustion_stalls_until_rotation() {
    let mesh = TestMesh::start(Topology::full(NodeMask::first_n(2)), 2, config());
    mesh.install_key(TEST_KEY);
    let geometry = BufferGeometry::for_buffer(8192, 2, 1024).unwrap();
    mesh.register(geometry, 12, 0).await;
    mesh.write_blocks(12, |rank| rank + 1);

    // Two nonces left for node 0's four chunks.
    let participants = mesh.participants();
    mesh.engine(0)
        .key(participants)
        .unwrap()
        .set_counter(n(0), NONCE_LIMIT - 2);
    for engine in &mesh.engines {
        assert_eq!(engine.start_generation(12).await.unwrap(), 1);
    }

    let node0 = mesh.engine(0);
    let node1 = mesh.engine(1);
    match node0.wait_generation(12, 1).await {
        Err(MeshError::KeyExhausted {
            reason: ExhaustionReason::Nonces,
            ..
        }) => {}
        other => panic!("expected nonce exhaustion, got {:?}", other),
    }
    let stalled = node0.buffer(12).unwrap();
    assert_eq!(stalled.phase(), BufferPhase::InFlight);
    assert!(stalled.stalled().is_some());
    assert!(matches!(
        node0.start_generation(12).await,
        Err(MeshError::KeyExhausted { .. })
    ));

    // Let everything sealed under the old key land before rotating.
    let receiver = node1.buffer(12).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while receiver.inbound().ready_count() < 2 || !stalled.all_received() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("chunks sealed before exhaustion were not delivered");
    assert_eq!(receiver.inbound().ready_count(), 2);

    mesh.install_key(ROTATED_KEY);
    assert_eq!(node0.start_generation(12).await.unwrap(), 1);
    for engine in &mesh.engines {
        engine.wait_generation(12, 1).await.unwrap();
        assert_eq!(engine.buffer(12).unwrap().phase(), BufferPhase::Complete);
    }
    assert_filled(&node1.read(12, 0, 4096).unwrap(), 1);
    assert_filled(&node0.read(12, 4096, 4096).unwrap(), 2);
    assert_eq!(node0.metrics().chunks_encrypted, 4);

    // The buffer keeps working under the new key.
    assert_eq!(mesh.run_generation(12).await.unwrap(), 2);
    mesh.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupted_start_keeps_key_accounting() {
    let mesh = TestMesh::start(Topology::full(NodeMask::first_n(2)), 2, config());
    mesh.install_key(TEST_KEY);
    let geometry = BufferGeometry::for_buffer(8192, 2, 1024).unwrap();
    mesh.register(geometry, 13, 0).await;

    let node1 = mesh.engine(1);
    let key = node1.key(mesh.participants()).unwrap();
    assert_eq!(key.buffers_used(), 0);
    node1.interrupt(13).unwrap();
    assert!(matches!(
        node1.start_generation(13).await,
        Err(MeshError::Interrupted)
    ));
    assert_eq!(key.buffers_used(), 0);
    assert_eq!(node1.buffer(13).unwrap().generation(), 0);

    node1.clear_interrupt(13).unwrap();
    assert_eq!(node1.start_generation(13).await.unwrap(), 1);
    assert_eq!(key.buffers_used(), 1);
    mesh.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interrupted_wait_returns_promptly() {
    let mesh = TestMesh::start(Topology::full(NodeMask::first_n(2)), 2, config());
    mesh.install_key(TEST_KEY);
    let geometry = BufferGeometry::for_buffer(8192, 2, 1024).unwrap();
    mesh.register(geometry, 4, 0).await;

    // Node 0 never starts, so nothing ever arrives at node 1.
    let node1 = Arc::clone(mesh.engine(1));
    node1.start_generation(4).await.unwrap();
    let waiter = {
        let node1 = Arc::clone(&node1);
        tokio::spawn(async move { node1.wait_all_received(4).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    node1.interrupt(4).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("interrupt did not wake the waiter")
        .unwrap();
    assert!(matches!(result, Err(MeshError::Interrupted)));

    // Level-triggered: a late waiter sees it too.
    assert!(matches!(
        node1.wait_all_received(4).await,
        Err(MeshError::Interrupted)
    ));

    node1.clear_interrupt(4).unwrap();
    mesh.engine(0).start_generation(4).await.unwrap();
    node1.wait_all_received(4).await.unwrap();
    mesh.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_times_out_distinctly() {
    let mesh = TestMesh::start(
        Topology::full(NodeMask::first_n(2)),
        2,
        MeshConfig {
            wait_timeout_ms: 100,
            ..MeshConfig::default()
        },
    );
    mesh.install_key(TEST_KEY);
    let geometry = BufferGeometry::for_buffer(8192, 2, 1024).unwrap();
    mesh.register(geometry, 5, 0).await;

    mesh.engine(1).start_generation(5).await.unwrap();
    match mesh.engine(1).wait_all_received(5).await {
        Err(MeshError::Timeout { after, .. }) => assert_eq!(after, Duration::from_millis(100)),
        other => panic!("expected a timeout, got {:?}", other),
    }
    mesh.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inbound_assignment_waits_for_peer() {
    let mesh = TestMesh::start(Topology::full(NodeMask::first_n(2)), 2, config());
    mesh.install_key(TEST_KEY);
    let geometry = BufferGeometry::for_buffer(8192, 2, 1024).unwrap();
    let participants = mesh.participants();

    // Node 0 announces before node 1 has even registered the buffer.
    let node0 = mesh.engine(0);
    node0
        .register_buffer(spec(6, geometry, participants, 0))
        .unwrap();
    node0.assign_outbound(6).await.unwrap();
    match node0.assign_inbound(6) {
        Err(e @ MeshError::PeerNotReady { pending: 4, .. }) => assert!(e.is_retryable()),
        other => panic!("expected PeerNotReady, got {:?}", other),
    }

    let node1 = mesh.engine(1);
    node1
        .register_buffer(spec(6, geometry, participants, 0))
        .unwrap();
    node1.prepare_buffer(6).await.unwrap();
    assert_eq!(node1.buffer(6).unwrap().inbound().len(), 4);

    node0.prepare_buffer(6).await.unwrap();
    assert!(mesh.engine(0).buffer(6).unwrap().assignments_complete());
    mesh.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bounded_buffer_terminates() {
    let mesh = TestMesh::start(Topology::full(NodeMask::first_n(2)), 2, config());
    mesh.install_key(TEST_KEY);
    let geometry = BufferGeometry::for_buffer(4096, 2, 1024).unwrap();
    mesh.register(geometry, 8, 2).await;
    mesh.write_blocks(8, |rank| 0xA0 + rank);

    mesh.run_generation(8).await.unwrap();
    let node0 = mesh.engine(0);
    assert_eq!(node0.buffer(8).unwrap().remaining_reads(), Some(1));
    assert_filled(&node0.read(8, 2048, 2048).unwrap(), 0xA1);
    mesh.run_generation(8).await.unwrap();

    let buffer = node0.buffer(8).unwrap();
    assert_eq!(buffer.phase(), BufferPhase::Exhausted);
    assert_eq!(buffer.remaining_reads(), Some(0));
    assert!(matches!(
        node0.read(8, 2048, 2048),
        Err(MeshError::UseAfterCompletion(8))
    ));
    assert!(matches!(
        node0.start_generation(8).await,
        Err(MeshError::UseAfterCompletion(8))
    ));
    assert!(matches!(
        node0.write_block(8, &[0; 2048]),
        Err(MeshError::UseAfterCompletion(8))
    ));
    mesh.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mismatched_keys_abort_the_buffer() {
    let mesh = TestMesh::start(Topology::full(NodeMask::first_n(2)), 2, config());
    let participants = mesh.participants();
    let flags = KeyFlags::ENCRYPT | KeyFlags::DECRYPT;
    mesh.engine(0).set_key(participants, TEST_KEY, flags).unwrap();
    mesh.engine(1).set_key(participants, ROTATED_KEY, flags).unwrap();
    let geometry = BufferGeometry::for_buffer(4096, 2, 1024).unwrap();
    mesh.register(geometry, 9, 0).await;

    mesh.engine(0).start_generation(9).await.unwrap();
    mesh.engine(1).start_generation(9).await.unwrap();
    let result = mesh.engine(1).wait_all_received(9).await;
    assert!(matches!(result, Err(MeshError::BufferAborted(_))));
    assert_eq!(mesh.engine(1).buffer(9).unwrap().phase(), BufferPhase::Failed);
    assert!(mesh.engine(1).metrics().auth_failures >= 1);
    assert!(matches!(
        mesh.engine(1).read(9, 0, 16),
        Err(MeshError::BufferAborted(_))
    ));
    mesh.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deregister_wakes_waiters() {
    let mesh = TestMesh::start(Topology::full(NodeMask::first_n(2)), 2, config());
    mesh.install_key(TEST_KEY);
    let geometry = BufferGeometry::for_buffer(4096, 2, 1024).unwrap();
    mesh.register(geometry, 10, 0).await;

    let node1 = Arc::clone(mesh.engine(1));
    node1.start_generation(10).await.unwrap();
    let buffer = node1.buffer(10).unwrap();
    let waiter = tokio::spawn({
        let buffer = Arc::clone(&buffer);
        async move { buffer.wait_all_received(Duration::from_secs(10)).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    node1.deregister_buffer(10).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("deregistration did not wake the waiter")
        .unwrap();
    assert!(matches!(result, Err(MeshError::BufferAborted(_))));
    assert!(node1.buffer(10).is_none());
    assert!(matches!(
        node1.start_generation(10).await,
        Err(MeshError::UnknownBuffer(10))
    ));
    assert!(matches!(
        node1.deregister_buffer(10),
        Err(MeshError::UnknownBuffer(10))
    ));
    mesh.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_registration_rejected() {
    let mesh = TestMesh::start(Topology::full(NodeMask::first_n(2)), 2, config());
    let geometry = BufferGeometry::for_buffer(4096, 2, 1024).unwrap();
    let spec = spec(11, geometry, mesh.participants(), 0);
    mesh.engine(0).register_buffer(spec.clone()).unwrap();
    assert!(matches!(
        mesh.engine(0).register_buffer(spec),
        Err(MeshError::BufferExists(11))
    ));
    mesh.shutdown().await;
    assert!(mesh.engine(0).is_shut_down());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_participant_rejected() {
    // Node 3 shares no neighbour with node 0 on this line.
    let topology = Topology::from_links(&[(0, 1), (1, 2), (2, 3)]).unwrap();
    let mesh = TestMesh::start(topology, 4, config());
    let geometry = BufferGeometry::for_buffer(4096, 4, 1024).unwrap();
    assert!(matches!(
        mesh.engine(0)
            .register_buffer(spec(12, geometry, NodeMask::first_n(4), 0)),
        Err(MeshError::Unreachable { .. })
    ));
    assert_eq!(mesh.fabric.topology().neighbors(n(3)), NodeMask::single(n(2)));
    mesh.shutdown().await;
}
