// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Checkpoint orchestrator: pause, reconcile, copy, emit, resume.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! The per-checkpoint sequence, strictly ordered:
//!
//! 1. pause every thread of every CPU session;
//! 2. rebuild the capability-map table of each child from its capability
//!    table readout, filtered to badges the shadow graph knows;
//! 3. build the set of region-map backing badges, which are excluded from
//!    content copying;
//! 4. drain all destruction FIFOs, then reconcile the stored-info graph
//!    against the live shadows;
//! 5. collect the designated-sub lists of managed dataspaces;
//! 6. detach the designated subs so future child faults mark them again;
//! 7. copy dataspace content, incrementally for managed dataspaces;
//! 8. serialize and compress;
//! 9. resume all threads.
//!
//! Reconciliation happens on a working copy of the stored graph; an abort
//! (`CheckpointConsistency`) discards the copy, so the graph that the next
//! checkpoint starts from stays internally consistent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use amber_wire::{Badge, Kcap};
use log::{debug, info, warn};

use crate::child::ChildRecord;
use crate::cpu::CpuSession;
use crate::parent::Parent;
use crate::pd::PdSession;
use crate::ram::DataspaceRecord;
use crate::rm::RegionMapShadow;
use crate::serialize;
use crate::stored::{
    StoredAttachedRegion, StoredChild, StoredCpuSession, StoredDataspace, StoredNativeCap,
    StoredPassiveSession, StoredPdSession, StoredRamSession, StoredRegionMap, StoredRmSession,
    StoredSessionMeta, StoredSignalContext, StoredSignalSource, StoredState, StoredThread,
};
use crate::{Engine, EngineError, PassiveSession, SnapshotBlob};

/// Translates badges to the child-side capability addresses read in step 2.
/// A badge allocated after the readout is resolved by one refresh of the
/// table; a badge that is still missing then is an inconsistency.
struct KcapResolver<'a> {
    parent: &'a Parent,
    label: String,
    table: HashMap<Badge, Kcap>,
    refreshed: bool,
}

impl KcapResolver<'_> {
    /// Kcap of a badge the child explicitly holds; its absence from the
    /// capability table aborts the checkpoint.
    fn strict(&mut self, badge: Badge) -> Result<Kcap, EngineError> {
        if let Some(kcap) = self.table.get(&badge) {
            return Ok(*kcap);
        }
        if !self.refreshed {
            self.refreshed = true;
            let readout = self.parent.cap_table.read_cap_table(&self.label)?;
            for (badge, kcap) in readout {
                self.table.entry(badge).or_insert(kcap);
            }
            if let Some(kcap) = self.table.get(&badge) {
                return Ok(*kcap);
            }
        }
        Err(EngineError::CheckpointConsistency(badge))
    }

    /// Kcap of an internal badge the child may never have observed directly.
    fn lenient(&self, badge: Badge) -> Kcap {
        self.table.get(&badge).copied().unwrap_or(Kcap::INVALID)
    }
}

impl Engine {
    /// Produce a snapshot of every monitored child. Mutually exclusive with
    /// any other checkpoint on the same engine; threads are resumed even
    /// when the checkpoint aborts.
    pub fn checkpoint(&self, include_binary: bool) -> Result<SnapshotBlob, EngineError> {
        let mut stored = self.stored().lock().expect("stored state lock");
        info!("checkpoint started");
        self.cpu_root().pause_all()?;
        let result = self.checkpoint_paused(&mut stored, include_binary);
        if let Err(err) = self.cpu_root().resume_all() {
            warn!("thread resume after checkpoint failed: {err}");
        }
        match &result {
            Ok(blob) => info!("checkpoint complete, {} bytes", blob.size),
            Err(err) => warn!("checkpoint aborted: {err}"),
        }
        result
    }

    fn checkpoint_paused(
        &self,
        stored: &mut StoredState,
        include_binary: bool,
    ) -> Result<SnapshotBlob, EngineError> {
        let children: Vec<Arc<ChildRecord>> = self
            .registry()
            .children()
            .into_iter()
            .filter(|child| !child.destroyed())
            .collect();

        // Step 2: rebuild the capability-map tables from scratch.
        let mut resolvers: HashMap<String, KcapResolver<'_>> = HashMap::new();
        for child in &children {
            let readout = self.parent().cap_table.read_cap_table(child.label())?;
            let shadow = shadow_badges(child);
            let mut table: Vec<(Badge, Kcap)> = readout
                .into_iter()
                .filter(|(badge, _)| shadow.contains(badge))
                .collect();
            table.sort_by_key(|(badge, _)| *badge);
            table.dedup_by_key(|(badge, _)| *badge);
            child.replace_cap_map(table.clone());
            resolvers.insert(
                child.label().to_owned(),
                KcapResolver {
                    parent: self.parent(),
                    label: child.label().to_owned(),
                    table: table.into_iter().collect(),
                    refreshed: false,
                },
            );
        }

        // Step 3: region-map backing badges, rebuilt from scratch.
        let region_map_set = self.region_map_badges();
        debug!(
            "{} region-map dataspaces excluded from copy",
            region_map_set.len()
        );

        // Step 4: drain destruction FIFOs, then reconcile into a working
        // copy of the stored graph.
        self.pd_root().drain_destroyed();
        self.cpu_root().drain_destroyed();
        self.ram_root().drain_destroyed();
        self.rm_root().drain_destroyed();
        self.log_root().drain_destroyed();
        self.timer_root().drain_destroyed();
        self.rom_root().drain_destroyed();
        for child in &children {
            let pd_gone = child
                .sessions
                .lock()
                .expect("session slots lock")
                .pd
                .is_none();
            if child.pd_was_attached() && pd_gone {
                child.mark_destroyed();
            }
        }
        self.registry().sweep_destroyed();

        let mut working = StoredState::default();
        for child in &children {
            if child.destroyed() {
                continue;
            }
            let resolver = resolvers
                .get_mut(child.label())
                .expect("resolver built in step 2");
            let stored_child = self.reconcile_child(child, resolver, &region_map_set, stored)?;
            working.children.push(stored_child);
        }

        // Step 5: collect the designated-sub lists before detaching; the
        // attached flags captured here decide what step 7 copies.
        let mut live_dataspaces: HashMap<String, Vec<DataspaceRecord>> = HashMap::new();
        for session in self.ram_root().sessions() {
            live_dataspaces.insert(session.child_label(), session.dataspaces());
        }

        // Step 6: detach designated subs so subsequent faults re-mark them.
        for session in self.ram_root().sessions() {
            session.detach_designated()?;
        }

        // Step 7: copy dataspace contents.
        self.copy_contents(&working, &live_dataspaces, &region_map_set)?;

        // Step 8: serialize and compress.
        let rom_images = if include_binary {
            self.rom_images(&working)?
        } else {
            HashMap::new()
        };
        let blob = serialize::serialize(
            &working,
            self.parent().ram.as_ref(),
            self.compressor(),
            &rom_images,
        )?;

        // Release backing dataspaces that no stored record references any
        // longer, then commit the working graph.
        self.free_orphaned_backings(stored, &working);
        *stored = working;
        Ok(blob)
    }

    fn reconcile_child(
        &self,
        child: &Arc<ChildRecord>,
        resolver: &mut KcapResolver<'_>,
        region_map_set: &HashSet<Badge>,
        old: &StoredState,
    ) -> Result<StoredChild, EngineError> {
        let slots = child.sessions.lock().expect("session slots lock");
        let pd = slots.pd.clone();
        let cpu = slots.cpu.clone();
        let ram = slots.ram.clone();
        let rm = slots.rm.clone();
        let log = slots.log.clone();
        let timer = slots.timer.clone();
        let rom = slots.rom.clone();
        drop(slots);

        let mut stored_child = StoredChild {
            label: child.label().to_owned(),
            bootstrapped: child.bootstrapped(),
            cap_map: child.cap_map(),
            ..StoredChild::default()
        };
        if let Some(pd) = pd {
            stored_child.pd = Some(reconcile_pd(&pd, resolver)?);
        }
        if let Some(cpu) = cpu {
            stored_child.cpu = Some(reconcile_cpu(&cpu, resolver)?);
        }
        if let Some(ram) = ram {
            stored_child.ram = Some(self.reconcile_ram(&ram, resolver, region_map_set, old)?);
        }
        if let Some(rm) = rm {
            stored_child.rm = Some(reconcile_rm(&rm, resolver)?);
        }
        if let Some(log) = log {
            stored_child.log = Some(reconcile_passive(&log, resolver)?);
        }
        if let Some(timer) = timer {
            stored_child.timer = Some(reconcile_passive(&timer, resolver)?);
        }
        if let Some(rom) = rom {
            stored_child.rom = Some(reconcile_passive(&rom, resolver)?);
        }
        Ok(stored_child)
    }

    fn reconcile_ram(
        &self,
        session: &crate::RamSession,
        resolver: &mut KcapResolver<'_>,
        region_map_set: &HashSet<Badge>,
        old: &StoredState,
    ) -> Result<StoredRamSession, EngineError> {
        let mut dataspaces = Vec::new();
        for record in session.dataspaces() {
            let backing = if region_map_set.contains(&record.badge) {
                None
            } else if let Some(existing) = old.find_backing(record.badge) {
                Some(existing)
            } else {
                Some(self.parent().ram.alloc(Badge::HOST, record.size, false)?)
            };
            dataspaces.push(StoredDataspace {
                badge: record.badge,
                kcap: resolver.strict(record.badge)?,
                size: record.size,
                cached: record.cached,
                backing,
            });
        }
        Ok(StoredRamSession {
            meta: stored_meta(session.meta(), resolver)?,
            dataspaces,
        })
    }

    fn copy_contents(
        &self,
        working: &StoredState,
        live: &HashMap<String, Vec<DataspaceRecord>>,
        region_map_set: &HashSet<Badge>,
    ) -> Result<(), EngineError> {
        let mut visited: HashSet<(Badge, Badge)> = HashSet::new();
        for stored_child in &working.children {
            let Some(ram) = &stored_child.ram else {
                continue;
            };
            let Some(records) = live.get(&stored_child.label) else {
                continue;
            };
            for stored_ds in &ram.dataspaces {
                if region_map_set.contains(&stored_ds.badge) {
                    continue;
                }
                let Some(backing) = stored_ds.backing else {
                    continue;
                };
                if !visited.insert((stored_ds.badge, backing)) {
                    continue;
                }
                let Some(record) = records.iter().find(|r| r.badge == stored_ds.badge) else {
                    continue;
                };
                match &record.managed {
                    Some(managed) => {
                        for sub in managed.subs.iter().filter(|sub| sub.attached) {
                            self.parent()
                                .ram
                                .copy(sub.badge, 0, backing, sub.rel_addr, sub.size)?;
                        }
                    }
                    None => {
                        self.parent()
                            .ram
                            .copy(record.badge, 0, backing, 0, record.size)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Union of the backing-dataspace badges of every region-map shadow
    /// across the PD and RM sessions.
    fn region_map_badges(&self) -> HashSet<Badge> {
        let mut set = HashSet::new();
        for session in self.pd_root().sessions() {
            set.insert(session.address_space().ds_badge());
            set.insert(session.stack_area().ds_badge());
            set.insert(session.linker_area().ds_badge());
        }
        for session in self.rm_root().sessions() {
            for map in session.region_maps() {
                set.insert(map.ds_badge());
            }
        }
        set
    }

    fn rom_images(
        &self,
        working: &StoredState,
    ) -> Result<HashMap<String, (Badge, u64)>, EngineError> {
        let mut images = HashMap::new();
        for stored_child in &working.children {
            if stored_child.rom.is_none() {
                continue;
            }
            let Some(child) = self.registry().find(&stored_child.label) else {
                continue;
            };
            let rom = child
                .sessions
                .lock()
                .expect("session slots lock")
                .rom
                .clone();
            if let Some(rom) = rom {
                images.insert(stored_child.label.clone(), rom.rom_dataspace()?);
            }
        }
        Ok(images)
    }

    fn free_orphaned_backings(&self, old: &StoredState, working: &StoredState) {
        for child in &old.children {
            let Some(ram) = &child.ram else {
                continue;
            };
            for ds in &ram.dataspaces {
                let Some(backing) = ds.backing else {
                    continue;
                };
                if working.backing_referenced(backing) {
                    continue;
                }
                if let Err(err) = self.parent().ram.free(Badge::HOST, backing) {
                    warn!("free of orphaned backing {backing} failed: {err}");
                }
            }
        }
    }
}

fn reconcile_pd(
    session: &PdSession,
    resolver: &mut KcapResolver<'_>,
) -> Result<StoredPdSession, EngineError> {
    let mut signal_sources = Vec::new();
    for record in session.signal_sources() {
        signal_sources.push(StoredSignalSource {
            badge: record.badge,
            kcap: resolver.strict(record.badge)?,
        });
    }
    let mut signal_contexts = Vec::new();
    for record in session.signal_contexts() {
        signal_contexts.push(StoredSignalContext {
            badge: record.badge,
            kcap: resolver.strict(record.badge)?,
            source_badge: record.source_badge,
            imprint: record.imprint,
        });
    }
    let mut native_caps = Vec::new();
    for record in session.native_caps() {
        native_caps.push(StoredNativeCap {
            badge: record.badge,
            kcap: resolver.strict(record.badge)?,
            ep_badge: record.ep_badge,
        });
    }
    Ok(StoredPdSession {
        meta: stored_meta(session.meta(), resolver)?,
        address_space: stored_region_map(&session.address_space(), resolver),
        stack_area: stored_region_map(&session.stack_area(), resolver),
        linker_area: stored_region_map(&session.linker_area(), resolver),
        signal_sources,
        signal_contexts,
        native_caps,
    })
}

fn reconcile_cpu(
    session: &CpuSession,
    resolver: &mut KcapResolver<'_>,
) -> Result<StoredCpuSession, EngineError> {
    let mut threads = Vec::new();
    for record in session.threads() {
        // The registers of a paused thread; retrieved once per checkpoint.
        let registers = session.thread_state(record.badge)?;
        threads.push(StoredThread {
            badge: record.badge,
            kcap: resolver.strict(record.badge)?,
            name: record.name,
            weight: record.weight,
            affinity: record.affinity,
            utcb: record.utcb,
            started: record.started,
            paused: record.paused,
            single_step: record.single_step,
            sigh_badge: record.sigh,
            registers,
            priority: record.priority,
            deadline: record.deadline,
        });
    }
    Ok(StoredCpuSession {
        meta: stored_meta(session.meta(), resolver)?,
        sigh_badge: session.sigh(),
        affinity: session.affinity(),
        threads,
    })
}

fn reconcile_rm(
    session: &crate::RmSession,
    resolver: &mut KcapResolver<'_>,
) -> Result<StoredRmSession, EngineError> {
    let mut region_maps = Vec::new();
    for map in session.region_maps() {
        region_maps.push(stored_region_map(&map, resolver));
    }
    Ok(StoredRmSession {
        meta: stored_meta(session.meta(), resolver)?,
        region_maps,
    })
}

fn reconcile_passive(
    session: &PassiveSession,
    resolver: &mut KcapResolver<'_>,
) -> Result<StoredPassiveSession, EngineError> {
    Ok(StoredPassiveSession {
        meta: stored_meta(session.meta(), resolver)?,
    })
}

fn stored_meta(
    meta: &crate::SessionMeta,
    resolver: &mut KcapResolver<'_>,
) -> Result<StoredSessionMeta, EngineError> {
    Ok(StoredSessionMeta {
        creation_args: meta.creation_args().to_owned(),
        upgrade_args: meta.upgrade_args(),
        badge: meta.badge(),
        kcap: resolver.strict(meta.badge())?,
        bootstrapped: meta.bootstrapped(),
    })
}

fn stored_region_map(map: &RegionMapShadow, resolver: &KcapResolver<'_>) -> StoredRegionMap {
    StoredRegionMap {
        badge: map.badge(),
        kcap: resolver.lenient(map.badge()),
        ds_badge: map.ds_badge(),
        sigh_badge: map.sigh(),
        attached: map
            .attached_regions()
            .iter()
            .map(|region| StoredAttachedRegion {
                ds_badge: region.ds_badge,
                rel_addr: region.rel_addr,
                size: region.size,
                offset: region.offset,
                executable: region.executable,
            })
            .collect(),
    }
}

/// Every badge reachable from the child record: the set the capability-map
/// readout is filtered against.
fn shadow_badges(child: &Arc<ChildRecord>) -> HashSet<Badge> {
    let slots = child.sessions.lock().expect("session slots lock");
    let mut set = HashSet::new();
    if let Some(pd) = &slots.pd {
        set.insert(pd.meta().badge());
        for map in [pd.address_space(), pd.stack_area(), pd.linker_area()] {
            set.insert(map.badge());
            set.insert(map.ds_badge());
        }
        for record in pd.signal_sources() {
            set.insert(record.badge);
        }
        for record in pd.signal_contexts() {
            set.insert(record.badge);
        }
        for record in pd.native_caps() {
            set.insert(record.badge);
            set.insert(record.ep_badge);
        }
    }
    if let Some(cpu) = &slots.cpu {
        set.insert(cpu.meta().badge());
        for record in cpu.threads() {
            set.insert(record.badge);
        }
    }
    if let Some(ram) = &slots.ram {
        set.insert(ram.meta().badge());
        for record in ram.dataspaces() {
            set.insert(record.badge);
        }
    }
    if let Some(rm) = &slots.rm {
        set.insert(rm.meta().badge());
        for map in rm.region_maps() {
            set.insert(map.badge());
            set.insert(map.ds_badge());
        }
    }
    for passive in [&slots.log, &slots.timer, &slots.rom].into_iter().flatten() {
        set.insert(passive.meta().badge());
    }
    set
}
