// Author: Lukas Bower
// Purpose: Shared random snapshot generator for wire-level tests.
#![forbid(unsafe_code)]

use amber_wire::{
    AffinityLocation, Attachment, AttachedRegionInfo, AttachmentRef, Badge, ChildInfo,
    CpuSessionInfo, DataspaceInfo, Kcap, NativeCapInfo, PassiveSessionInfo, PdSessionInfo,
    RamSessionInfo, RegionMapInfo, RmSessionInfo, SessionInfo, SignalContextInfo,
    SignalSourceInfo, Snapshot, ThreadInfo, ThreadRegisters,
};
use rand::Rng;

/// Build a structurally valid snapshot with randomized content.
pub fn random_snapshot<R: Rng>(rng: &mut R) -> Snapshot {
    let attachment_count = rng.random_range(0..4u32);
    let attachments = (0..attachment_count)
        .map(|_| {
            let len = rng.random_range(0..256);
            let mut bytes = vec![0u8; len];
            rng.fill_bytes(&mut bytes);
            Attachment::from_bytes(bytes)
        })
        .collect::<Vec<_>>();

    let child_count = rng.random_range(0..3);
    let children = (0..child_count)
        .map(|index| random_child(rng, index, attachment_count))
        .collect();

    Snapshot {
        children,
        attachments,
    }
}

fn random_child<R: Rng>(rng: &mut R, index: usize, attachment_count: u32) -> ChildInfo {
    ChildInfo {
        label: format!("child-{index}"),
        bootstrapped: rng.random_bool(0.5),
        pd: PdSessionInfo {
            base: random_session(rng),
            address_space: random_region_map(rng),
            stack_area: random_region_map(rng),
            linker_area: random_region_map(rng),
            signal_sources: (0..rng.random_range(0..3))
                .map(|_| SignalSourceInfo {
                    badge: random_badge(rng),
                    kcap: random_kcap(rng),
                })
                .collect(),
            signal_contexts: (0..rng.random_range(0..3))
                .map(|_| SignalContextInfo {
                    badge: random_badge(rng),
                    kcap: random_kcap(rng),
                    source_badge: random_badge(rng),
                    imprint: rng.random(),
                })
                .collect(),
            native_caps: (0..rng.random_range(0..3))
                .map(|_| NativeCapInfo {
                    badge: random_badge(rng),
                    kcap: random_kcap(rng),
                    ep_badge: random_badge(rng),
                })
                .collect(),
        },
        ram: RamSessionInfo {
            base: random_session(rng),
            dataspaces: (0..rng.random_range(0..4))
                .map(|_| DataspaceInfo {
                    badge: random_badge(rng),
                    kcap: random_kcap(rng),
                    size: rng.random_range(0..1 << 20),
                    cached: rng.random_bool(0.5),
                    content: random_attachment_ref(rng, attachment_count),
                })
                .collect(),
        },
        cpu: CpuSessionInfo {
            base: random_session(rng),
            sigh_badge: random_badge(rng),
            affinity: random_affinity(rng),
            threads: (0..rng.random_range(0..3))
                .map(|thread| random_thread(rng, thread))
                .collect(),
        },
        rm: rng.random_bool(0.5).then(|| RmSessionInfo {
            base: random_session(rng),
            region_maps: (0..rng.random_range(0..3))
                .map(|_| random_region_map(rng))
                .collect(),
        }),
        log: rng.random_bool(0.5).then(|| PassiveSessionInfo {
            base: random_session(rng),
        }),
        timer: rng.random_bool(0.5).then(|| PassiveSessionInfo {
            base: random_session(rng),
        }),
        rom: rng.random_bool(0.5).then(|| PassiveSessionInfo {
            base: random_session(rng),
        }),
        capability_map: (0..rng.random_range(0..8))
            .map(|_| (random_badge(rng), random_kcap(rng)))
            .collect(),
        binary: random_attachment_ref(rng, attachment_count),
    }
}

fn random_session<R: Rng>(rng: &mut R) -> SessionInfo {
    SessionInfo {
        creation_args: format!("ram_quota={}, label=\"x\"", rng.random_range(0..1u64 << 20)),
        upgrade_args: if rng.random_bool(0.5) {
            format!("ram_quota={}", rng.random_range(0..1u64 << 20))
        } else {
            String::new()
        },
        badge: random_badge(rng),
        kcap: random_kcap(rng),
        bootstrapped: rng.random_bool(0.5),
    }
}

fn random_region_map<R: Rng>(rng: &mut R) -> RegionMapInfo {
    RegionMapInfo {
        badge: random_badge(rng),
        kcap: random_kcap(rng),
        ds_badge: random_badge(rng),
        sigh_badge: random_badge(rng),
        attached: (0..rng.random_range(0..3))
            .map(|_| AttachedRegionInfo {
                ds_badge: random_badge(rng),
                rel_addr: rng.random(),
                size: rng.random(),
                offset: rng.random(),
                executable: rng.random_bool(0.5),
            })
            .collect(),
    }
}

fn random_thread<R: Rng>(rng: &mut R, index: usize) -> ThreadInfo {
    let mut registers = ThreadRegisters::default();
    for word in &mut registers.gpr {
        *word = rng.random();
    }
    registers.ip = rng.random();
    registers.sp = rng.random();
    ThreadInfo {
        badge: random_badge(rng),
        kcap: random_kcap(rng),
        name: format!("thread-{index}"),
        weight: rng.random_range(0..1 << 10),
        affinity: random_affinity(rng),
        utcb: rng.random(),
        started: rng.random_bool(0.5),
        paused: rng.random_bool(0.5),
        single_step: rng.random_bool(0.5),
        sigh_badge: random_badge(rng),
        registers,
        priority: rng.random_range(0..128),
        deadline: rng.random_range(0..10_000),
    }
}

fn random_badge<R: Rng>(rng: &mut R) -> Badge {
    Badge::from_raw(rng.random())
}

fn random_kcap<R: Rng>(rng: &mut R) -> Kcap {
    Kcap::from_raw(rng.random())
}

fn random_affinity<R: Rng>(rng: &mut R) -> AffinityLocation {
    AffinityLocation::new(
        rng.random_range(0..4),
        rng.random_range(0..4),
        rng.random_range(0..4),
        rng.random_range(0..4),
    )
}

fn random_attachment_ref<R: Rng>(rng: &mut R, attachment_count: u32) -> Option<AttachmentRef> {
    if attachment_count == 0 || rng.random_bool(0.5) {
        None
    } else {
        Some(AttachmentRef::from_raw(
            rng.random_range(0..attachment_count),
        ))
    }
}
