// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Round-trip property tests for the snapshot record stream.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use amber_wire::{decode_snapshot, encode_snapshot, Snapshot};
use rand::rngs::StdRng;
use rand::SeedableRng;

mod util;

#[test]
fn random_snapshots_round_trip() {
    let iterations = std::env::var("AMBER_WIRE_FUZZ_ITERS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(256);
    let mut rng = StdRng::seed_from_u64(0x0DDB_A11);

    for _ in 0..iterations {
        let snapshot = util::random_snapshot(&mut rng);
        let bytes = encode_snapshot(&snapshot);
        let decoded = decode_snapshot(&bytes).expect("well-formed snapshot must decode");
        assert_eq!(decoded, snapshot);
    }
}

#[test]
fn empty_snapshot_round_trips() {
    let snapshot = Snapshot::default();
    let bytes = encode_snapshot(&snapshot);
    assert_eq!(decode_snapshot(&bytes).expect("decode"), snapshot);
}

#[test]
fn encoding_is_deterministic() {
    let mut rng = StdRng::seed_from_u64(42);
    let snapshot = util::random_snapshot(&mut rng);
    assert_eq!(encode_snapshot(&snapshot), encode_snapshot(&snapshot));
}
