//! Cross-group discovery, border bookkeeping and level separation.

use crate::test_utils::Mesh;
use loomnet_mesh::{EntityFlags, EntityKey};

#[test]
fn test_cross_group_neighbors_create_border_links() {
    // a sits in group 2, d in sibling group 8; they share every level above
    let mut mesh = Mesh::new(&[("a", [1, 2, 3, 4, 5]), ("d", [9, 8, 3, 4, 5])]);
    mesh.bus.link("a", "d");

    mesh.radar_cycle();

    let a = mesh.node("a");
    let foreign = a.ctx.store().entity(EntityKey::new(1, 8));
    assert!(!foreign.is_void());
    assert!(foreign.flags.contains(EntityFlags::EXTERNAL));
    // a's own level-0 root now bridges toward group 8
    let links = a.ctx.store().borders(0).links_of(1).unwrap();
    assert!(links.iter().any(|l| l.upper_gid == 8));

    let d = mesh.node("d");
    assert!(!d.ctx.store().entity(EntityKey::new(1, 2)).is_void());
    let links = d.ctx.store().borders(0).links_of(9).unwrap();
    assert!(links.iter().any(|l| l.upper_gid == 2));
}

#[test]
fn test_group_level_floods_cross_the_border() {
    let mut mesh = Mesh::new(&[("a", [1, 2, 3, 4, 5]), ("d", [9, 8, 3, 4, 5])]);
    mesh.bus.link("a", "d");
    mesh.radar_cycle();

    let pkt = mesh.node_mut("d").ctx.originate_flood(1);
    mesh.pump();

    let a = mesh.node("a");
    let foreign = a.ctx.store().entity(EntityKey::new(1, 8));
    assert_eq!(foreign.broadcast_seen, pkt.broadcast_id);
    // The hop carried the foreign group's occupancy
    assert_eq!(a.ctx.store().group(EntityKey::new(1, 8)).unwrap().seeds, 1);
}

#[test]
fn test_node_level_floods_stay_inside_the_group() {
    // b shares a's group; d is in a sibling group, linked to a only
    let mut mesh = Mesh::new(&[
        ("a", [1, 2, 3, 4, 5]),
        ("b", [2, 2, 3, 4, 5]),
        ("d", [9, 8, 3, 4, 5]),
    ]);
    mesh.bus.link("a", "b");
    mesh.bus.link("a", "d");
    mesh.radar_cycle();

    mesh.node_mut("b").ctx.originate_flood(0);
    mesh.pump();

    // a merged b's flood; d's level-0 arena describes d's own group and
    // must know nothing of node ids from a's group
    assert!(!mesh
        .node("a")
        .ctx
        .store()
        .entity(EntityKey::new(0, 2))
        .is_void());
    assert!(mesh
        .node("d")
        .ctx
        .store()
        .entity(EntityKey::new(0, 2))
        .is_void());
    assert!(mesh
        .node("d")
        .ctx
        .store()
        .entity(EntityKey::new(0, 1))
        .is_void());
}

#[test]
fn test_border_teardown_when_foreign_neighbor_vanishes() {
    let mut mesh = Mesh::new(&[("a", [1, 2, 3, 4, 5]), ("d", [9, 8, 3, 4, 5])]);
    mesh.bus.link("a", "d");
    mesh.radar_cycle();
    assert!(mesh.node("a").ctx.store().borders(0).is_border(1));

    mesh.bus.unlink("a", "d");
    let reports = mesh.radar_cycle();

    assert!(reports[0].removed.contains(&EntityKey::new(1, 8)));
    let a = mesh.node("a");
    assert!(a.ctx.store().entity(EntityKey::new(1, 8)).is_void());
    assert!(!a.ctx.store().borders(0).is_border(1));
}
