// Author: Lukas Bower
// Purpose: Shared fixtures for engine integration tests.
#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use amber_keep::compress::Identity;
use amber_keep::config::Config;
use amber_keep::inproc::InProcParent;
use amber_keep::{CpuSession, Engine, PdSession, RamSession, SnapshotBlob};
use amber_wire::{decode_snapshot, Badge, ChildInfo, Snapshot};

/// Engine over a fresh in-process parent, with pass-through compression so
/// tests can decode blobs directly.
pub fn engine(config: Config) -> (Arc<InProcParent>, Engine) {
    let parent = InProcParent::new();
    let engine = Engine::with_compressor(parent.parent(), config, Box::new(Identity));
    (parent, engine)
}

/// The session triple every monitored child starts with.
pub struct ChildHandles {
    pub pd: Arc<PdSession>,
    pub cpu: Arc<CpuSession>,
    pub ram: Arc<RamSession>,
}

/// Open PD, CPU, and RAM sessions for a child label.
pub fn open_child(engine: &Engine, label: &str) -> ChildHandles {
    let pd = engine
        .pd_root()
        .create_session(&format!("ram_quota=1048576, label=\"{label}\""))
        .expect("pd session");
    let cpu = engine
        .cpu_root()
        .create_session(&format!("ram_quota=131072, label=\"{label}\""))
        .expect("cpu session");
    let ram = engine
        .ram_root()
        .create_session(&format!("ram_quota=1048576, label=\"{label}\""))
        .expect("ram session");
    ChildHandles { pd, cpu, ram }
}

/// Decode an uncompressed snapshot blob.
pub fn decode(blob: &SnapshotBlob) -> Snapshot {
    decode_snapshot(&blob.bytes).expect("snapshot must decode")
}

/// Every badge appearing in a decoded child's records.
pub fn record_badges(child: &ChildInfo) -> BTreeSet<Badge> {
    let mut set = BTreeSet::new();
    set.insert(child.pd.base.badge);
    for map in [&child.pd.address_space, &child.pd.stack_area, &child.pd.linker_area] {
        set.insert(map.badge);
        set.insert(map.ds_badge);
    }
    for source in &child.pd.signal_sources {
        set.insert(source.badge);
    }
    for context in &child.pd.signal_contexts {
        set.insert(context.badge);
    }
    for native in &child.pd.native_caps {
        set.insert(native.badge);
        set.insert(native.ep_badge);
    }
    set.insert(child.cpu.base.badge);
    for thread in &child.cpu.threads {
        set.insert(thread.badge);
    }
    set.insert(child.ram.base.badge);
    for ds in &child.ram.dataspaces {
        set.insert(ds.badge);
    }
    if let Some(rm) = &child.rm {
        set.insert(rm.base.badge);
        for map in &rm.region_maps {
            set.insert(map.badge);
            set.insert(map.ds_badge);
        }
    }
    for passive in [&child.log, &child.timer, &child.rom].into_iter().flatten() {
        set.insert(passive.base.badge);
    }
    set
}

/// The badge set of a decoded capability map.
pub fn cap_map_badges(child: &ChildInfo) -> BTreeSet<Badge> {
    child.capability_map.iter().map(|(badge, _)| *badge).collect()
}
