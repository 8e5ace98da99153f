// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Fuzz-style regression tests for snapshot stream framing.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::panic::{catch_unwind, AssertUnwindSafe};

use amber_wire::{decode_snapshot, encode_snapshot, fuzz_decode};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

mod util;

#[test]
fn fuzz_decode_survives_mutated_streams() {
    let iterations = std::env::var("AMBER_WIRE_FUZZ_ITERS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(512);
    let mut rng = StdRng::seed_from_u64(0xA3B3_1E57);

    for _ in 0..iterations {
        let snapshot = util::random_snapshot(&mut rng);
        let mut stream = encode_snapshot(&snapshot);
        mutate_stream(&mut rng, &mut stream);
        let result = catch_unwind(AssertUnwindSafe(|| fuzz_decode(&stream)));
        assert!(result.is_ok(), "decoder panicked on mutated stream");
    }
}

#[test]
fn fuzz_decode_survives_garbage() {
    let mut rng = StdRng::seed_from_u64(0x5EED_F00D);
    for _ in 0..256 {
        let len = rng.random_range(0..512);
        let mut bytes = vec![0u8; len];
        rng.fill_bytes(&mut bytes);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = decode_snapshot(&bytes);
        }));
        assert!(result.is_ok(), "decoder panicked on garbage input");
    }
}

fn mutate_stream<R: Rng>(rng: &mut R, stream: &mut Vec<u8>) {
    if stream.len() < 5 {
        return;
    }
    match rng.random_range(0..4) {
        0 => {
            let declared: u32 = rng.random();
            stream[0..4].copy_from_slice(&declared.to_le_bytes());
        }
        1 => {
            if stream.len() > 6 {
                let new_len = rng.random_range(5..stream.len());
                stream.truncate(new_len);
            }
        }
        2 => {
            let index = rng.random_range(0..stream.len());
            stream[index] = rng.random();
        }
        _ => {
            let tail_len = rng.random_range(1..16);
            let mut tail = vec![0u8; tail_len];
            rng.fill_bytes(&mut tail);
            stream.extend_from_slice(&tail);
        }
    }
}
