// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Incremental copy of granularity-managed RAM dataspaces.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use amber_keep::config::Config;
use amber_keep::inproc::InProcParent;
use amber_keep::parent::RamBackend;
use amber_keep::RamSession;
use amber_wire::{Badge, ChildInfo, Snapshot};

mod util;

fn managed_config() -> Config {
    serde_json::from_str(r#"{ "granularity": 4096 }"#).expect("config")
}

/// Touch one byte of a managed dataspace the way a running child would: the
/// fault attaches the designated sub, then the write lands through the
/// managing region map.
fn child_write(parent: &InProcParent, ram: &RamSession, ds: Badge, offset: u64, byte: u8) {
    ram.handle_fault(ds, offset).expect("fault");
    RamBackend::write(parent, ds, offset, &[byte]).expect("write");
}

fn dataspace_bytes(snapshot: &Snapshot, child: &ChildInfo, ds: Badge) -> Vec<u8> {
    let record = child
        .ram
        .dataspaces
        .iter()
        .find(|record| record.badge == ds)
        .expect("dataspace record");
    let content = record.content.expect("dataspace content attachment");
    snapshot
        .attachment(content)
        .expect("attachment in side table")
        .bytes
        .clone()
}

#[test]
fn managed_dataspace_copies_incrementally() {
    let (parent, engine) = util::engine(managed_config());
    let child = util::open_child(&engine, "hello");

    let ds = child.ram.alloc(65536, false).expect("managed dataspace");
    child_write(&parent, &child.ram, ds, 0x3000, 0xAB);

    let blob_a = engine.checkpoint(false).expect("checkpoint A");
    let snapshot_a = util::decode(&blob_a);
    let bytes_a = dataspace_bytes(&snapshot_a, &snapshot_a.children[0], ds);
    assert_eq!(bytes_a.len(), 65536);
    assert_eq!(bytes_a[0x3000], 0xAB);
    assert!(bytes_a
        .iter()
        .enumerate()
        .all(|(index, byte)| index == 0x3000 || *byte == 0));

    child_write(&parent, &child.ram, ds, 0x7000, 0xCD);

    let blob_b = engine.checkpoint(false).expect("checkpoint B");
    let snapshot_b = util::decode(&blob_b);
    let bytes_b = dataspace_bytes(&snapshot_b, &snapshot_b.children[0], ds);
    assert_eq!(bytes_b[0x3000], 0xAB);
    assert_eq!(bytes_b[0x7000], 0xCD);

    // The backing dataspace was reused: exactly one byte differs between
    // the two consecutive snapshots of this dataspace.
    let diff: Vec<usize> = bytes_a
        .iter()
        .zip(bytes_b.iter())
        .enumerate()
        .filter(|(_, (a, b))| a != b)
        .map(|(index, _)| index)
        .collect();
    assert_eq!(diff, vec![0x7000]);
}

#[test]
fn untouched_managed_dataspace_copies_nothing_new() {
    let (parent, engine) = util::engine(managed_config());
    let child = util::open_child(&engine, "hello");

    let ds = child.ram.alloc(16384, false).expect("managed dataspace");
    child_write(&parent, &child.ram, ds, 0x1000, 0x42);

    let blob_a = engine.checkpoint(false).expect("checkpoint A");
    // No child activity between A and B: the blobs are byte-identical.
    let blob_b = engine.checkpoint(false).expect("checkpoint B");
    assert_eq!(blob_a, blob_b);
}

#[test]
fn unmanaged_dataspace_copies_whole_content() {
    let (parent, engine) = util::engine(Config::default());
    let child = util::open_child(&engine, "hello");

    let ds = child.ram.alloc(8192, true).expect("dataspace");
    RamBackend::write(parent.as_ref(), ds, 100, &[1, 2, 3]).expect("write");

    let blob = engine.checkpoint(false).expect("checkpoint");
    let snapshot = util::decode(&blob);
    let child_info = &snapshot.children[0];
    assert!(child_info.ram.dataspaces[0].cached);
    let bytes = dataspace_bytes(&snapshot, child_info, ds);
    assert_eq!(&bytes[100..103], &[1, 2, 3]);
}

#[test]
fn freed_dataspace_leaves_the_snapshot() {
    let (_parent, engine) = util::engine(Config::default());
    let child = util::open_child(&engine, "hello");

    let ds = child.ram.alloc(4096, false).expect("dataspace");
    child.ram.free(ds).expect("free");

    let blob = engine.checkpoint(false).expect("checkpoint");
    let snapshot = util::decode(&blob);
    assert!(snapshot.children[0].ram.dataspaces.is_empty());
    assert!(snapshot.attachments.is_empty());
}
