// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Session upgrade accounting and verbatim argument forwarding.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use amber_keep::config::Config;
use amber_keep::parent::PdBackend;

mod util;

#[test]
fn double_upgrade_keeps_latest_string_and_calls_parent_twice() {
    let (parent, engine) = util::engine(Config::default());
    let pd = engine
        .pd_root()
        .create_session("ram_quota=8192, label=\"hello\"")
        .expect("pd session");
    let badge = pd.meta().badge();

    let quota_after_create =
        PdBackend::ram_quota(parent.as_ref(), badge).expect("parent quota query");

    engine
        .pd_root()
        .upgrade(badge, "ram_quota=4096")
        .expect("first upgrade");
    engine
        .pd_root()
        .upgrade(badge, "ram_quota=4096")
        .expect("second upgrade");

    // The shadow stores the latest upgrade string verbatim and the
    // accumulated quota; the parent received both upgrades.
    assert_eq!(pd.meta().upgrade_args(), "ram_quota=4096");
    assert_eq!(pd.meta().quota(), 8192 + 4096 + 4096);
    let quota_after_upgrades =
        PdBackend::ram_quota(parent.as_ref(), badge).expect("parent quota query");
    assert_eq!(quota_after_upgrades, quota_after_create + 8192);

    let blob = engine.checkpoint(false).expect("checkpoint");
    let snapshot = util::decode(&blob);
    assert_eq!(snapshot.children[0].pd.base.upgrade_args, "ram_quota=4096");
    // The snapshot carries the child's original creation quota, not the
    // readjusted one the parent saw.
    assert_eq!(
        snapshot.children[0].pd.base.creation_args,
        "ram_quota=8192, label=\"hello\""
    );
    assert!(quota_after_create > 8192);
}

#[test]
fn upgrade_of_unknown_session_is_rejected() {
    let (_parent, engine) = util::engine(Config::default());
    let err = engine
        .pd_root()
        .upgrade(amber_wire::Badge::from_raw(77), "ram_quota=4096")
        .expect_err("unknown badge must be rejected");
    assert!(matches!(err, amber_keep::EngineError::UnknownBadge(_)));
}
