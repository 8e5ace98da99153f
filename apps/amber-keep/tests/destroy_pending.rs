// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Deferred destruction of signal contexts through the tombstone FIFO.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use amber_keep::config::Config;
use amber_keep::EngineError;
use amber_wire::Badge;

mod util;

#[test]
fn freed_contexts_are_released_exactly_once_at_the_next_checkpoint() {
    let (_parent, engine) = util::engine(Config::default());
    let child = util::open_child(&engine, "hello");

    let source = child.pd.alloc_signal_source().expect("signal source");
    let contexts: Vec<Badge> = (0..6)
        .map(|imprint| {
            child
                .pd
                .alloc_context(source, imprint)
                .expect("signal context")
        })
        .collect();

    for context in &contexts[..5] {
        child.pd.free_context(*context).expect("free context");
    }
    assert_eq!(child.pd.pending_destruction(), 5);

    let blob = engine.checkpoint(false).expect("checkpoint");
    let snapshot = util::decode(&blob);
    let stored_contexts = &snapshot.children[0].pd.signal_contexts;
    assert_eq!(stored_contexts.len(), 1);
    assert_eq!(stored_contexts[0].badge, contexts[5]);
    assert_eq!(stored_contexts[0].source_badge, source);
    assert_eq!(stored_contexts[0].imprint, 5);
    assert_eq!(child.pd.pending_destruction(), 0);

    // A second checkpoint does not release anything further.
    let blob = engine.checkpoint(false).expect("second checkpoint");
    let snapshot = util::decode(&blob);
    assert_eq!(snapshot.children[0].pd.signal_contexts.len(), 1);
}

#[test]
fn freeing_an_untracked_context_leaves_the_shadow_unchanged() {
    let (_parent, engine) = util::engine(Config::default());
    let child = util::open_child(&engine, "hello");

    let err = child
        .pd
        .free_context(Badge::from_raw(4242))
        .expect_err("untracked badge must be rejected");
    assert!(matches!(err, EngineError::UnknownBadge(_)));
    assert_eq!(child.pd.pending_destruction(), 0);
}

#[test]
fn rpc_cap_lookup_keys_on_the_endpoint_badge() {
    let (_parent, engine) = util::engine(Config::default());
    let child = util::open_child(&engine, "hello");

    let ep = child.pd.meta().badge();
    let cap = child.pd.alloc_rpc_cap(ep).expect("rpc cap");
    assert_ne!(cap, ep);

    // Freeing presents the endpoint badge, not the capability badge.
    child.pd.free_rpc_cap(ep).expect("free by endpoint badge");
    assert_eq!(child.pd.pending_destruction(), 1);

    let blob = engine.checkpoint(false).expect("checkpoint");
    let snapshot = util::decode(&blob);
    assert!(snapshot.children[0].pd.native_caps.is_empty());
}
