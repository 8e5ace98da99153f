// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Region-map backing dataspaces never travel as content attachments.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use amber_keep::config::Config;
use amber_wire::Badge;

mod util;

#[test]
fn region_map_backings_are_excluded_from_content_copy() {
    let config: Config = serde_json::from_str(r#"{ "granularity": 4096 }"#).expect("config");
    let (_parent, engine) = util::engine(config);
    let child = util::open_child(&engine, "hello");

    // An RM session with one extra region map, plus a managed dataspace
    // attached into it; the managed dataspace itself must still be copied.
    let rm = engine
        .rm_root()
        .create_session("ram_quota=65536, label=\"hello\"")
        .expect("rm session");
    let map = rm.create_region_map(0x20000).expect("region map");
    let ds = child.ram.alloc(8192, false).expect("managed dataspace");
    child.ram.handle_fault(ds, 0).expect("fault");
    map.attach(ds, 8192, 0, 0, false, false).expect("attach");

    let blob = engine.checkpoint(false).expect("checkpoint");
    let snapshot = util::decode(&blob);
    let child_info = &snapshot.children[0];

    let mut region_map_backings: BTreeSet<Badge> = BTreeSet::new();
    for map in [
        &child_info.pd.address_space,
        &child_info.pd.stack_area,
        &child_info.pd.linker_area,
    ] {
        region_map_backings.insert(map.ds_badge);
    }
    for map in &child_info.rm.as_ref().expect("rm session").region_maps {
        region_map_backings.insert(map.ds_badge);
    }

    let copied: BTreeSet<Badge> = child_info
        .ram
        .dataspaces
        .iter()
        .filter(|record| record.content.is_some())
        .map(|record| record.badge)
        .collect();

    assert!(region_map_backings.is_disjoint(&copied));
    // The managed dataspace is not a region-map backing from the child's
    // point of view and carries content.
    assert!(copied.contains(&ds));

    // The attach is mirrored by an attached-region record at the returned
    // address.
    let attached = &child_info.rm.as_ref().expect("rm session").region_maps[0].attached;
    assert_eq!(attached.len(), 1);
    assert_eq!(attached[0].ds_badge, ds);
    assert_eq!(attached[0].size, 8192);
}

#[test]
fn detach_removes_the_attached_region_record() {
    let (_parent, engine) = util::engine(Config::default());
    let child = util::open_child(&engine, "hello");

    let rm = engine
        .rm_root()
        .create_session("ram_quota=65536, label=\"hello\"")
        .expect("rm session");
    let map = rm.create_region_map(0x10000).expect("region map");
    let ds = child.ram.alloc(4096, false).expect("dataspace");
    let rel_addr = map.attach(ds, 4096, 0, 0, false, false).expect("attach");
    map.detach(rel_addr).expect("detach");

    let blob = engine.checkpoint(false).expect("checkpoint");
    let snapshot = util::decode(&blob);
    let maps = &snapshot.children[0].rm.as_ref().expect("rm session").region_maps;
    assert!(maps[0].attached.is_empty());
}
