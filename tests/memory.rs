//! Reclamation tests: node memory must return to the live set once no
//! snapshot can observe the deleted nodes.

use std::time::Duration;

use nitro::Nitro;

fn key10(i: usize) -> Vec<u8> {
    format!("{:010}", i).into_bytes()
}

fn wait_until(db: &Nitro, mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        db.collect();
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("condition not reached in time");
}

#[test]
fn test_gc_reclaims_replaced_nodes() {
    let db = Nitro::new();
    let writers = 4;
    let per_writer = 250;
    let iterations = 50;

    let mut last = None;
    for _ in 0..iterations {
        std::thread::scope(|s| {
            for t in 0..writers {
                let db = &db;
                s.spawn(move || {
                    let mut w = db.new_writer();
                    for i in 0..per_writer {
                        let k = key10(t * per_writer + i);
                        w.delete(&k);
                        w.put(&k);
                    }
                });
            }
        });
        let curr = db.new_snapshot().unwrap();
        if let Some(prev) = last.replace(curr) {
            prev.close();
        }
    }

    let snap = db.new_snapshot().unwrap();
    if let Some(prev) = last.take() {
        prev.close();
    }

    // Everything that is no longer visible must eventually be freed.
    let live = (writers * per_writer) as u64;
    wait_until(&db, || db.get_stats().node_count <= live);
    assert_eq!(snap.count(), live);

    snap.close();
    db.close();
}

#[test]
fn test_memory_returns_after_full_delete() {
    let db = Nitro::new();
    let mut w = db.new_writer();
    let n = 5000;
    for i in 0..n {
        w.put(&key10(i));
    }
    let snap1 = w.new_snapshot().unwrap();

    for i in 0..n {
        assert!(w.delete(&key10(i)));
    }
    snap1.close();
    let snap2 = w.new_snapshot().unwrap();
    let snap3 = w.new_snapshot().unwrap();
    snap2.close();

    // snap3 pins nothing: every node is dead below its horizon.
    wait_until(&db, || db.get_stats().node_frees >= n as u64);
    assert_eq!(db.item_count(), 0);
    assert_eq!(snap3.count(), 0);

    snap3.close();
    db.close();
    wait_until(&db, || db.get_stats().node_count == 0);
}

#[test]
fn test_node_frees_reach_delete_count() {
    let db = Nitro::new();
    let mut w = db.new_writer();
    let n = 20_000;
    for i in 0..n {
        w.put(&key10(i));
    }
    let snap = w.new_snapshot().unwrap();
    snap.close();

    let mut snaps = Vec::new();
    for i in 0..n {
        if i % 1000 == 0 {
            snaps.push(w.new_snapshot().unwrap());
        }
        assert!(w.delete(&key10(i)));
    }
    snaps.push(w.new_snapshot().unwrap());

    for snap in snaps {
        snap.close();
    }

    wait_until(&db, || db.get_stats().node_frees == n as u64);
    db.close();
}
