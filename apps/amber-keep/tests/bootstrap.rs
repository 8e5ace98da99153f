// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Checkpoint a freshly bootstrapped child and inspect the snapshot.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use amber_keep::config::Config;

mod util;

#[test]
fn bootstrap_only_child_produces_minimal_snapshot() {
    let (_parent, engine) = util::engine(Config::default());
    util::open_child(&engine, "hello");

    let blob = engine.checkpoint(false).expect("checkpoint");
    let snapshot = util::decode(&blob);

    assert_eq!(snapshot.children.len(), 1);
    let child = &snapshot.children[0];
    assert_eq!(child.label, "hello");
    assert!(child.bootstrapped);

    // The three standard region maps exist and are backed by distinct
    // dataspaces.
    let backings = [
        child.pd.address_space.ds_badge,
        child.pd.stack_area.ds_badge,
        child.pd.linker_area.ds_badge,
    ];
    assert!(backings.iter().all(|badge| badge.into_raw() != 0));
    assert_ne!(backings[0], backings[1]);
    assert_ne!(backings[1], backings[2]);
    assert_ne!(backings[0], backings[2]);

    assert!(child.pd.signal_sources.is_empty());
    assert!(child.pd.signal_contexts.is_empty());
    assert!(child.cpu.threads.is_empty());
    assert!(child.ram.dataspaces.is_empty());
    assert!(child.rm.is_none());
    assert!(!child.capability_map.is_empty());
    assert!(snapshot.attachments.is_empty());
}

#[test]
fn bootstrap_flag_clears_for_later_sessions() {
    let (_parent, engine) = util::engine(Config::default());
    util::open_child(&engine, "hello");
    engine.finish_bootstrap("hello");
    let log = engine
        .log_root()
        .create_session("ram_quota=8192, label=\"hello\"")
        .expect("log session");
    assert!(!log.meta().bootstrapped());

    let blob = engine.checkpoint(false).expect("checkpoint");
    let snapshot = util::decode(&blob);
    let child = &snapshot.children[0];
    assert!(!child.bootstrapped);
    // Sessions opened during bootstrap keep their flag.
    assert!(child.pd.base.bootstrapped);
    assert!(!child.log.as_ref().expect("log session").base.bootstrapped);
}

#[test]
fn creation_args_travel_bit_preserved() {
    let (_parent, engine) = util::engine(Config::default());
    let creation_args = "ram_quota=8192, diag=1, label=\"hello\"";
    engine
        .pd_root()
        .create_session(creation_args)
        .expect("pd session");

    let blob = engine.checkpoint(false).expect("checkpoint");
    let snapshot = util::decode(&blob);
    assert_eq!(snapshot.children[0].pd.base.creation_args, creation_args);
}
