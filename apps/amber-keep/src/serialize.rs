// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Flatten the stored-info graph into the snapshot wire stream.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Walks the stored graph once, building the wire-level child list plus the
//! attachment side table; dataspace content is read out of the backing
//! dataspaces, and with a binary image available the child's ROM module
//! travels as one more attachment. The concatenated stream is handed to the
//! compression oracle; the compressed bytes and their length are returned.

use std::collections::HashMap;

use amber_wire::{
    encode_snapshot, Attachment, AttachmentRef, Badge, ChildInfo, CpuSessionInfo, DataspaceInfo,
    PassiveSessionInfo, PdSessionInfo, RamSessionInfo, RegionMapInfo, RmSessionInfo, SessionInfo,
    Snapshot, ThreadInfo,
};

use crate::compress::Compressor;
use crate::parent::RamBackend;
use crate::stored::{
    StoredChild, StoredCpuSession, StoredPassiveSession, StoredPdSession, StoredRamSession,
    StoredRegionMap, StoredRmSession, StoredSessionMeta, StoredState,
};
use crate::{EngineError, SnapshotBlob};

pub(crate) fn serialize(
    stored: &StoredState,
    ram: &dyn RamBackend,
    compressor: &dyn Compressor,
    rom_images: &HashMap<String, (Badge, u64)>,
) -> Result<SnapshotBlob, EngineError> {
    let mut attachments: Vec<Attachment> = Vec::new();
    let mut children = Vec::with_capacity(stored.children.len());
    for child in &stored.children {
        children.push(child_info(child, ram, rom_images, &mut attachments)?);
    }
    let snapshot = Snapshot {
        children,
        attachments,
    };
    let bytes = compressor.compress(&encode_snapshot(&snapshot));
    let size = bytes.len();
    Ok(SnapshotBlob { bytes, size })
}

fn child_info(
    child: &StoredChild,
    ram: &dyn RamBackend,
    rom_images: &HashMap<String, (Badge, u64)>,
    attachments: &mut Vec<Attachment>,
) -> Result<ChildInfo, EngineError> {
    let ram_info = match &child.ram {
        Some(session) => ram_session_info(session, ram, attachments)?,
        None => RamSessionInfo::default(),
    };
    let binary = match rom_images.get(&child.label) {
        Some(&(ds, size)) => Some(push_attachment(ram, ds, size, attachments)?),
        None => None,
    };
    Ok(ChildInfo {
        label: child.label.clone(),
        bootstrapped: child.bootstrapped,
        pd: child.pd.as_ref().map(pd_session_info).unwrap_or_default(),
        ram: ram_info,
        cpu: child.cpu.as_ref().map(cpu_session_info).unwrap_or_default(),
        rm: child.rm.as_ref().map(rm_session_info),
        log: child.log.as_ref().map(passive_session_info),
        timer: child.timer.as_ref().map(passive_session_info),
        rom: child.rom.as_ref().map(passive_session_info),
        capability_map: child.cap_map.clone(),
        binary,
    })
}

fn ram_session_info(
    session: &StoredRamSession,
    ram: &dyn RamBackend,
    attachments: &mut Vec<Attachment>,
) -> Result<RamSessionInfo, EngineError> {
    let mut dataspaces = Vec::with_capacity(session.dataspaces.len());
    for ds in &session.dataspaces {
        let content = match ds.backing {
            Some(backing) => Some(push_attachment(ram, backing, ds.size, attachments)?),
            None => None,
        };
        dataspaces.push(DataspaceInfo {
            badge: ds.badge,
            kcap: ds.kcap,
            size: ds.size,
            cached: ds.cached,
            content,
        });
    }
    Ok(RamSessionInfo {
        base: session_info(&session.meta),
        dataspaces,
    })
}

fn push_attachment(
    ram: &dyn RamBackend,
    ds: Badge,
    size: u64,
    attachments: &mut Vec<Attachment>,
) -> Result<AttachmentRef, EngineError> {
    let mut bytes = vec![0u8; size as usize];
    ram.read(ds, 0, &mut bytes)?;
    let index = attachments.len() as u32;
    attachments.push(Attachment::from_bytes(bytes));
    Ok(AttachmentRef::from_raw(index))
}

fn pd_session_info(session: &StoredPdSession) -> PdSessionInfo {
    PdSessionInfo {
        base: session_info(&session.meta),
        address_space: region_map_info(&session.address_space),
        stack_area: region_map_info(&session.stack_area),
        linker_area: region_map_info(&session.linker_area),
        signal_sources: session
            .signal_sources
            .iter()
            .map(|source| amber_wire::SignalSourceInfo {
                badge: source.badge,
                kcap: source.kcap,
            })
            .collect(),
        signal_contexts: session
            .signal_contexts
            .iter()
            .map(|context| amber_wire::SignalContextInfo {
                badge: context.badge,
                kcap: context.kcap,
                source_badge: context.source_badge,
                imprint: context.imprint,
            })
            .collect(),
        native_caps: session
            .native_caps
            .iter()
            .map(|native| amber_wire::NativeCapInfo {
                badge: native.badge,
                kcap: native.kcap,
                ep_badge: native.ep_badge,
            })
            .collect(),
    }
}

fn cpu_session_info(session: &StoredCpuSession) -> CpuSessionInfo {
    CpuSessionInfo {
        base: session_info(&session.meta),
        sigh_badge: session.sigh_badge,
        affinity: session.affinity,
        threads: session
            .threads
            .iter()
            .map(|thread| ThreadInfo {
                badge: thread.badge,
                kcap: thread.kcap,
                name: thread.name.clone(),
                weight: thread.weight,
                affinity: thread.affinity,
                utcb: thread.utcb,
                started: thread.started,
                paused: thread.paused,
                single_step: thread.single_step,
                sigh_badge: thread.sigh_badge,
                registers: thread.registers,
                priority: thread.priority,
                deadline: thread.deadline,
            })
            .collect(),
    }
}

fn rm_session_info(session: &StoredRmSession) -> RmSessionInfo {
    RmSessionInfo {
        base: session_info(&session.meta),
        region_maps: session.region_maps.iter().map(region_map_info).collect(),
    }
}

fn passive_session_info(session: &StoredPassiveSession) -> PassiveSessionInfo {
    PassiveSessionInfo {
        base: session_info(&session.meta),
    }
}

fn region_map_info(map: &StoredRegionMap) -> RegionMapInfo {
    RegionMapInfo {
        badge: map.badge,
        kcap: map.kcap,
        ds_badge: map.ds_badge,
        sigh_badge: map.sigh_badge,
        attached: map
            .attached
            .iter()
            .map(|region| amber_wire::AttachedRegionInfo {
                ds_badge: region.ds_badge,
                rel_addr: region.rel_addr,
                size: region.size,
                offset: region.offset,
                executable: region.executable,
            })
            .collect(),
    }
}

fn session_info(meta: &StoredSessionMeta) -> SessionInfo {
    SessionInfo {
        creation_args: meta.creation_args.clone(),
        upgrade_args: meta.upgrade_args.clone(),
        badge: meta.badge,
        kcap: meta.kcap,
        bootstrapped: meta.bootstrapped,
    }
}
