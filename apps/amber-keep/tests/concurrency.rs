// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Checkpoints racing concurrent session activity stay consistent.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::thread;

use amber_keep::config::Config;
use amber_keep::EngineError;
use amber_wire::AffinityLocation;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

mod util;

const WORKERS: usize = 4;
const OPS_PER_WORKER: usize = 150;

#[test]
fn concurrent_children_and_checkpoints_stay_consistent() {
    let (_parent, engine) = util::engine(Config::default());

    thread::scope(|scope| {
        for worker in 0..WORKERS {
            let engine = &engine;
            scope.spawn(move || {
                let label = format!("worker-{worker}");
                let child = util::open_child(engine, &label);
                let mut rng = StdRng::seed_from_u64(worker as u64);
                let mut dataspaces = Vec::new();
                let mut sources = Vec::new();
                for _ in 0..OPS_PER_WORKER {
                    match rng.random_range(0..5) {
                        0 => dataspaces.push(child.ram.alloc(4096, false).expect("alloc")),
                        1 => {
                            if let Some(ds) = dataspaces.pop() {
                                child.ram.free(ds).expect("free");
                            }
                        }
                        2 => sources.push(child.pd.alloc_signal_source().expect("source")),
                        3 => {
                            child
                                .cpu
                                .create_thread(
                                    child.pd.meta().badge(),
                                    "spinner",
                                    AffinityLocation::default(),
                                    1,
                                    0,
                                )
                                .expect("thread");
                        }
                        _ => {
                            if let Some(source) = sources.first() {
                                child
                                    .pd
                                    .alloc_context(*source, rng.random())
                                    .expect("context");
                            }
                        }
                    }
                }
            });
        }

        // Checkpoints race the workers. A pass that observes a half-issued
        // free may abort; an abort resumes the tree and the next pass runs.
        for _ in 0..6 {
            match engine.checkpoint(false) {
                Ok(blob) => {
                    let snapshot = util::decode(&blob);
                    for child in &snapshot.children {
                        for ds in &child.ram.dataspaces {
                            if let Some(content) = ds.content {
                                let attachment = snapshot
                                    .attachment(content)
                                    .expect("attachment reference resolves");
                                assert_eq!(attachment.size, ds.size);
                            }
                        }
                    }
                }
                Err(EngineError::CheckpointConsistency(_) | EngineError::Parent(_)) => {}
                Err(other) => panic!("unexpected checkpoint failure: {other}"),
            }
        }
    });

    // Quiesced: the final checkpoint must succeed and satisfy the
    // shadow-versus-capability-map property for every child.
    let blob = engine.checkpoint(false).expect("final checkpoint");
    let snapshot = util::decode(&blob);
    assert_eq!(snapshot.children.len(), WORKERS);
    for child in &snapshot.children {
        assert_eq!(util::cap_map_badges(child), util::record_badges(child));
    }
}
