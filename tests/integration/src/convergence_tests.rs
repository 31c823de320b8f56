//! Route convergence and flood behavior across several nodes.

use crate::test_utils::Mesh;
use loomnet_mesh::EntityKey;

#[test]
fn test_full_mesh_nodes_learn_each_other_directly() {
    let mut mesh = Mesh::new(&[
        ("a", [1, 2, 3, 4, 5]),
        ("b", [2, 2, 3, 4, 5]),
        ("c", [3, 2, 3, 4, 5]),
    ]);
    mesh.bus.link("a", "b");
    mesh.bus.link("b", "c");
    mesh.bus.link("a", "c");

    let reports = mesh.radar_cycle();
    assert!(reports.iter().all(|r| r.neighbors.len() == 2));

    for (peer, others) in [("a", [2u8, 3]), ("b", [1, 3]), ("c", [1, 2])] {
        let node = mesh.node(peer);
        for other in others {
            let record = node.ctx.store().entity(EntityKey::new(0, other));
            assert!(!record.is_void(), "{peer} should know node {other}");
            // Direct neighbors route through themselves
            assert_eq!(
                record.best_gateway().unwrap().target,
                EntityKey::new(0, other)
            );
        }
    }
}

#[test]
fn test_line_topology_converges_through_relays() {
    // a - b - c: the ends only ever hear about each other from b's relays
    let mut mesh = Mesh::new(&[
        ("a", [1, 2, 3, 4, 5]),
        ("b", [2, 2, 3, 4, 5]),
        ("c", [3, 2, 3, 4, 5]),
    ]);
    mesh.bus.link("a", "b");
    mesh.bus.link("b", "c");

    mesh.radar_cycle();

    let a = mesh.node("a");
    let to_c = a.ctx.store().entity(EntityKey::new(0, 3));
    assert!(!to_c.is_void(), "a should have learned about c");
    assert_eq!(to_c.best_gateway().unwrap().target, EntityKey::new(0, 2));

    let c = mesh.node("c");
    let to_a = c.ctx.store().entity(EntityKey::new(0, 1));
    assert!(!to_a.is_void());
    assert_eq!(to_a.best_gateway().unwrap().target, EntityKey::new(0, 2));

    // The middle node never hears of anyone beyond its two neighbors
    let b = mesh.node("b");
    assert!(b.ctx.store().entity(EntityKey::new(0, 1)).gateways.len() <= 2);
}

#[test]
fn test_flood_terminates_in_cyclic_topology() {
    let mut mesh = Mesh::new(&[
        ("a", [1, 2, 3, 4, 5]),
        ("b", [2, 2, 3, 4, 5]),
        ("c", [3, 2, 3, 4, 5]),
    ]);
    mesh.bus.link("a", "b");
    mesh.bus.link("b", "c");
    mesh.bus.link("a", "c");
    mesh.radar_cycle();

    // A fresh flood around the triangle: relays must die out once every
    // node has merged the counter, despite the cycle
    let pkt = mesh.node_mut("a").ctx.originate_flood(0);
    let processed = mesh.pump();

    // Two direct deliveries plus at most one relay each way
    assert!(processed <= 6, "flood kept circulating: {processed} frames");
    for peer in ["b", "c"] {
        let seen = mesh
            .node(peer)
            .ctx
            .store()
            .entity(EntityKey::new(0, 1))
            .broadcast_seen;
        assert_eq!(seen, pkt.broadcast_id, "{peer} missed the flood");
    }
}

#[test]
fn test_replayed_flood_changes_nothing() {
    let mut mesh = Mesh::new(&[("a", [1, 2, 3, 4, 5]), ("b", [2, 2, 3, 4, 5])]);
    mesh.bus.link("a", "b");
    mesh.radar_cycle();

    mesh.node_mut("a").ctx.originate_flood(0);
    mesh.pump();
    let gateways_before = mesh
        .node("b")
        .ctx
        .store()
        .entity(EntityKey::new(0, 1))
        .gateways
        .clone();
    let seen_before = mesh
        .node("b")
        .ctx
        .store()
        .entity(EntityKey::new(0, 1))
        .broadcast_seen;

    // Same counter again: b drops it at validation
    let stale = loomnet_mesh::TracerPacket {
        level: 0,
        originator: 1,
        broadcast_id: seen_before,
        hops: vec![loomnet_mesh::tracer::TracerHop {
            id: 1,
            rtt_ms: 0,
            occupancy: 2,
        }],
        borders: vec![],
    };
    let frame = loomnet_mesh::MeshFrame::from_node(
        loomnet_mesh::HierAddr::new(loomnet_mesh::AddrFamily::Ipv4, vec![1, 2, 3, 4, 5]).unwrap(),
        loomnet_mesh::MeshPayload::Tracer(stale),
    );
    let result = mesh
        .node_mut("b")
        .ctx
        .handle_frame(&"a".to_string(), &frame);
    assert!(result.is_err());

    let b = mesh.node("b");
    assert_eq!(
        b.ctx.store().entity(EntityKey::new(0, 1)).gateways,
        gateways_before
    );
    assert_eq!(
        b.ctx.store().entity(EntityKey::new(0, 1)).broadcast_seen,
        seen_before
    );
}

#[test]
fn test_vanished_neighbor_is_torn_down() {
    let mut mesh = Mesh::new(&[
        ("a", [1, 2, 3, 4, 5]),
        ("b", [2, 2, 3, 4, 5]),
        ("c", [3, 2, 3, 4, 5]),
    ]);
    mesh.bus.link("a", "b");
    mesh.bus.link("b", "c");
    mesh.radar_cycle();
    assert!(!mesh
        .node("b")
        .ctx
        .store()
        .entity(EntityKey::new(0, 3))
        .is_void());

    // c drops off the air
    mesh.bus.unlink("b", "c");
    let reports = mesh.radar_cycle();

    // b noticed and voided c
    let b_report = &reports[1];
    assert!(b_report.removed.contains(&EntityKey::new(0, 3)));
    assert!(b_report.send_tracer_now);
    assert!(mesh
        .node("b")
        .ctx
        .store()
        .entity(EntityKey::new(0, 3))
        .is_void());
    assert!(!mesh.node("b").ctx.neighbor_addrs().contains_key("c"));

    // a keeps its link to b intact
    assert!(!mesh
        .node("a")
        .ctx
        .store()
        .entity(EntityKey::new(0, 2))
        .is_void());
}
