// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Thread shadow lifecycle across checkpoints.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use amber_keep::config::Config;
use amber_keep::EngineError;
use amber_wire::{AffinityLocation, Badge};

mod util;

fn config_with_affinity() -> Config {
    serde_json::from_str(r#"{ "children": [ { "name": "hello", "xpos": 1, "ypos": 0 } ] }"#)
        .expect("config")
}

#[test]
fn thread_create_and_kill_drains_shadow() {
    let (_parent, engine) = util::engine(config_with_affinity());
    let child = util::open_child(&engine, "hello");

    let thread = child
        .cpu
        .create_thread(
            child.pd.meta().badge(),
            "T1",
            AffinityLocation::new(1, 0, 1, 1),
            10,
            0xdead_0000,
        )
        .expect("create thread");
    child.cpu.start_thread(thread, 0x1000, 0x2000).expect("start");

    let blob = engine.checkpoint(false).expect("checkpoint with live thread");
    let snapshot = util::decode(&blob);
    let threads = &snapshot.children[0].cpu.threads;
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].name, "T1");
    assert_eq!(threads[0].weight, 10);
    assert!(threads[0].started);
    // The shadow is seeded with the statically configured child affinity.
    assert_eq!(threads[0].affinity, AffinityLocation::new(1, 0, 1, 1));

    child.cpu.kill_thread(thread).expect("kill");
    assert_eq!(child.cpu.pending_destruction(), 1);

    let blob = engine.checkpoint(false).expect("checkpoint after kill");
    let snapshot = util::decode(&blob);
    assert!(snapshot.children[0].cpu.threads.is_empty());
    assert_eq!(child.cpu.pending_destruction(), 0);
}

#[test]
fn create_thread_rejects_foreign_pd_badge() {
    let (_parent, engine) = util::engine(Config::default());
    let child = util::open_child(&engine, "hello");

    let err = child
        .cpu
        .create_thread(
            Badge::from_raw(9999),
            "T1",
            AffinityLocation::default(),
            10,
            0,
        )
        .expect_err("foreign pd badge must be rejected");
    assert!(matches!(err, EngineError::UnknownPdBadge(badge) if badge == Badge::from_raw(9999)));
}

#[test]
fn fp_edf_thread_records_scheduling_parameters() {
    let (_parent, engine) = util::engine(Config::default());
    let child = util::open_child(&engine, "hello");

    child
        .cpu
        .create_fp_edf_thread(
            child.pd.meta().badge(),
            "rt-worker",
            AffinityLocation::default(),
            20,
            0,
            42,
            1_000,
        )
        .expect("create fp-edf thread");

    let blob = engine.checkpoint(false).expect("checkpoint");
    let snapshot = util::decode(&blob);
    let threads = &snapshot.children[0].cpu.threads;
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].priority, 42);
    assert_eq!(threads[0].deadline, 1_000);
}

#[test]
fn exception_handler_badge_is_recorded() {
    let (_parent, engine) = util::engine(Config::default());
    let child = util::open_child(&engine, "hello");

    let source = child.pd.alloc_signal_source().expect("signal source");
    let handler = child.pd.alloc_context(source, 7).expect("signal context");
    child.cpu.exception_sigh(handler);

    let blob = engine.checkpoint(false).expect("checkpoint");
    let snapshot = util::decode(&blob);
    assert_eq!(snapshot.children[0].cpu.sigh_badge, handler);
}
