// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Stored-info mirror graph persisted between checkpoints.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! The stored-info graph mirrors the live shadow graph with the fields that
//! end up in the snapshot, plus the badge of the content-backing dataspace
//! holding each RAM dataspace's copied bytes. The graph survives between
//! checkpoints so an unchanged source badge keeps its backing dataspace,
//! which is what makes managed-dataspace copies incremental.

use amber_wire::{AffinityLocation, Badge, Kcap, ThreadRegisters};

/// Common stored fields of a session record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StoredSessionMeta {
    pub creation_args: String,
    pub upgrade_args: String,
    pub badge: Badge,
    pub kcap: Kcap,
    pub bootstrapped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoredAttachedRegion {
    pub ds_badge: Badge,
    pub rel_addr: u64,
    pub size: u64,
    pub offset: u64,
    pub executable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StoredRegionMap {
    pub badge: Badge,
    pub kcap: Kcap,
    pub ds_badge: Badge,
    pub sigh_badge: Badge,
    pub attached: Vec<StoredAttachedRegion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoredSignalSource {
    pub badge: Badge,
    pub kcap: Kcap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoredSignalContext {
    pub badge: Badge,
    pub kcap: Kcap,
    pub source_badge: Badge,
    pub imprint: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoredNativeCap {
    pub badge: Badge,
    pub kcap: Kcap,
    pub ep_badge: Badge,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StoredPdSession {
    pub meta: StoredSessionMeta,
    pub address_space: StoredRegionMap,
    pub stack_area: StoredRegionMap,
    pub linker_area: StoredRegionMap,
    pub signal_sources: Vec<StoredSignalSource>,
    pub signal_contexts: Vec<StoredSignalContext>,
    pub native_caps: Vec<StoredNativeCap>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredThread {
    pub badge: Badge,
    pub kcap: Kcap,
    pub name: String,
    pub weight: u64,
    pub affinity: AffinityLocation,
    pub utcb: u64,
    pub started: bool,
    pub paused: bool,
    pub single_step: bool,
    pub sigh_badge: Badge,
    pub registers: ThreadRegisters,
    pub priority: u32,
    pub deadline: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StoredCpuSession {
    pub meta: StoredSessionMeta,
    pub sigh_badge: Badge,
    pub affinity: AffinityLocation,
    pub threads: Vec<StoredThread>,
}

/// Stored RAM dataspace. `backing` names the engine-owned dataspace holding
/// the copied content; it is absent for dataspaces excluded from copying
/// (region-map backings).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoredDataspace {
    pub badge: Badge,
    pub kcap: Kcap,
    pub size: u64,
    pub cached: bool,
    pub backing: Option<Badge>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StoredRamSession {
    pub meta: StoredSessionMeta,
    pub dataspaces: Vec<StoredDataspace>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StoredRmSession {
    pub meta: StoredSessionMeta,
    pub region_maps: Vec<StoredRegionMap>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StoredPassiveSession {
    pub meta: StoredSessionMeta,
}

/// Stored aggregate of one monitored child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StoredChild {
    pub label: String,
    pub bootstrapped: bool,
    pub pd: Option<StoredPdSession>,
    pub cpu: Option<StoredCpuSession>,
    pub ram: Option<StoredRamSession>,
    pub rm: Option<StoredRmSession>,
    pub log: Option<StoredPassiveSession>,
    pub timer: Option<StoredPassiveSession>,
    pub rom: Option<StoredPassiveSession>,
    pub cap_map: Vec<(Badge, Kcap)>,
}

/// The stored graph of all children, persisted between checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StoredState {
    pub children: Vec<StoredChild>,
}

impl StoredState {
    /// Find the content-backing dataspace previously allocated for a source
    /// badge anywhere in the stored graph. Backing reuse is what keeps
    /// consecutive checkpoints incremental.
    pub fn find_backing(&self, badge: Badge) -> Option<Badge> {
        self.children.iter().find_map(|child| {
            child.ram.as_ref().and_then(|ram| {
                ram.dataspaces
                    .iter()
                    .find(|ds| ds.badge == badge)
                    .and_then(|ds| ds.backing)
            })
        })
    }

    /// Whether any stored dataspace still references `backing` as its
    /// content store. Checked before freeing a backing dataspace.
    pub fn backing_referenced(&self, backing: Badge) -> bool {
        self.children.iter().any(|child| {
            child.ram.as_ref().is_some_and(|ram| {
                ram.dataspaces.iter().any(|ds| ds.backing == Some(backing))
            })
        })
    }
}
