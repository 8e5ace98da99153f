// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Binary inclusion, passive sessions, and the compression seam.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use amber_keep::config::Config;
use amber_keep::Engine;
use amber_wire::decode_snapshot;

mod util;

#[test]
fn include_binary_attaches_the_rom_image() {
    let (parent, engine) = util::engine(Config::default());
    parent.set_rom_image("hello", b"\x7fELF fixture image");
    util::open_child(&engine, "hello");
    engine
        .rom_root()
        .create_session("ram_quota=8192, label=\"hello\", filename=\"hello\"")
        .expect("rom session");

    let blob = engine.checkpoint(true).expect("checkpoint");
    let snapshot = util::decode(&blob);
    let child = &snapshot.children[0];
    let binary = child.binary.expect("binary attachment reference");
    let attachment = snapshot.attachment(binary).expect("binary attachment");
    assert_eq!(attachment.bytes, b"\x7fELF fixture image");

    // Without the flag the image stays out of the stream.
    let blob = engine.checkpoint(false).expect("checkpoint without binary");
    let snapshot = util::decode(&blob);
    assert!(snapshot.children[0].binary.is_none());
    assert!(snapshot.attachments.is_empty());
}

#[test]
fn passive_sessions_capture_creation_args_only() {
    let (_parent, engine) = util::engine(Config::default());
    util::open_child(&engine, "hello");
    engine
        .log_root()
        .create_session("ram_quota=8192, label=\"hello\"")
        .expect("log session");
    engine
        .timer_root()
        .create_session("ram_quota=8192, label=\"hello\"")
        .expect("timer session");

    let blob = engine.checkpoint(false).expect("checkpoint");
    let snapshot = util::decode(&blob);
    let child = &snapshot.children[0];
    assert_eq!(
        child.log.as_ref().expect("log session").base.creation_args,
        "ram_quota=8192, label=\"hello\""
    );
    assert!(child.timer.is_some());
    assert!(child.rom.is_none());
}

#[test]
fn deflate_compressed_snapshot_inflates_and_decodes() {
    let parent = amber_keep::inproc::InProcParent::new();
    let engine = Engine::new(parent.parent(), Config::default());
    let child = util::open_child(&engine, "hello");
    child.ram.alloc(16384, false).expect("dataspace");

    let blob = engine.checkpoint(false).expect("checkpoint");
    assert_eq!(blob.size, blob.bytes.len());
    let inflated =
        miniz_oxide::inflate::decompress_to_vec(&blob.bytes).expect("inflate snapshot");
    let snapshot = decode_snapshot(&inflated).expect("decode snapshot");
    assert_eq!(snapshot.children[0].label, "hello");
    assert_eq!(snapshot.children[0].ram.dataspaces.len(), 1);
}
