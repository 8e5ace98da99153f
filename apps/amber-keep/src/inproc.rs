// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: In-process parent environment backing host tests and demos.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! A complete in-memory implementation of the parent backend traits: badge
//! allocation, dataspace byte buffers, region maps with attachment
//! resolution, a thread registry, and per-child capability tables. The
//! engine drives it exactly like a real parent environment, which is what
//! makes the integration scenarios end-to-end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use amber_wire::{AffinityLocation, Badge, Kcap, ThreadRegisters};
use log::trace;

use crate::parent::{
    CapTableBackend, CpuBackend, FaultState, ParentError, PassiveBackend, PassiveKind, Parent,
    PdBackend, PdHandle, RamBackend, RegionMapHandle, RmBackend,
};

const KCAP_BASE: u64 = 0x1000;
const KCAP_STRIDE: u64 = 0x10;

#[derive(Debug)]
enum Backing {
    Bytes(Vec<u8>),
    Map(Badge),
}

#[derive(Debug)]
struct Dataspace {
    size: u64,
    backing: Backing,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    rel_addr: u64,
    size: u64,
    ds: Badge,
    offset: u64,
}

#[derive(Debug)]
struct RegionMap {
    ds_badge: Badge,
    size: u64,
    next_addr: u64,
    regions: Vec<Region>,
}

#[derive(Debug, Default)]
struct Thread {
    paused: bool,
    registers: ThreadRegisters,
}

#[derive(Debug, Clone)]
struct SessionObject {
    label: String,
    quota: u64,
}

#[derive(Default)]
struct KernelModel {
    next_badge: u16,
    next_kcap: u64,
    refuse_sessions: bool,
    sessions: HashMap<Badge, SessionObject>,
    dataspaces: HashMap<Badge, Dataspace>,
    region_maps: HashMap<Badge, RegionMap>,
    threads: HashMap<Badge, Thread>,
    cap_tables: HashMap<String, Vec<(Badge, Kcap)>>,
    rom_preload: HashMap<String, Vec<u8>>,
    rom_images: HashMap<Badge, Badge>,
}

impl KernelModel {
    fn alloc_badge(&mut self) -> Badge {
        self.next_badge += 1;
        Badge::from_raw(self.next_badge)
    }

    fn register_cap(&mut self, label: &str, badge: Badge) {
        let kcap = Kcap::from_raw(KCAP_BASE + self.next_kcap);
        self.next_kcap += KCAP_STRIDE;
        self.cap_tables
            .entry(label.to_owned())
            .or_default()
            .push((badge, kcap));
    }

    fn unregister_cap(&mut self, badge: Badge) {
        for table in self.cap_tables.values_mut() {
            table.retain(|(entry, _)| *entry != badge);
        }
    }

    fn session_label(&self, session: Badge) -> Result<String, ParentError> {
        self.sessions
            .get(&session)
            .map(|object| object.label.clone())
            .ok_or(ParentError::UnknownHandle(session))
    }

    fn check_admission(&self) -> Result<(), ParentError> {
        if self.refuse_sessions {
            return Err(ParentError::Refused("session admission disabled".to_owned()));
        }
        Ok(())
    }

    fn open_session(&mut self, label: &str, args: &str) -> Badge {
        let badge = self.alloc_badge();
        self.sessions.insert(
            badge,
            SessionObject {
                label: label.to_owned(),
                quota: crate::args::unsigned_value(args, "ram_quota"),
            },
        );
        self.register_cap(label, badge);
        badge
    }

    fn new_dataspace(&mut self, size: u64, backing: Backing) -> Badge {
        let badge = self.alloc_badge();
        self.dataspaces.insert(badge, Dataspace { size, backing });
        badge
    }

    fn new_region_map(&mut self, size: u64) -> RegionMapHandle {
        let rm_badge = self.alloc_badge();
        let ds_badge = self.new_dataspace(size, Backing::Map(rm_badge));
        self.region_maps.insert(
            rm_badge,
            RegionMap {
                ds_badge,
                size,
                next_addr: 0,
                regions: Vec::new(),
            },
        );
        RegionMapHandle {
            badge: rm_badge,
            ds_badge,
        }
    }

    /// Resolve a byte range of a dataspace down to leaf buffers, splitting
    /// across region boundaries for map-backed dataspaces.
    fn access(
        &mut self,
        ds: Badge,
        offset: u64,
        len: u64,
        apply: &mut dyn FnMut(&mut Vec<u8>, usize, usize),
    ) -> Result<(), ParentError> {
        if len == 0 {
            return Ok(());
        }
        let (size, mapped) = {
            let space = self
                .dataspaces
                .get(&ds)
                .ok_or(ParentError::UnknownHandle(ds))?;
            let mapped = match &space.backing {
                Backing::Bytes(_) => None,
                Backing::Map(rm_badge) => Some(*rm_badge),
            };
            (space.size, mapped)
        };
        if offset + len > size {
            return Err(ParentError::Refused(format!(
                "access beyond end of {ds}: {offset:#x}+{len:#x}"
            )));
        }
        match mapped {
            None => {
                let space = self.dataspaces.get_mut(&ds).expect("dataspace present");
                let Backing::Bytes(bytes) = &mut space.backing else {
                    unreachable!("mapped flag checked above");
                };
                apply(bytes, offset as usize, len as usize);
                Ok(())
            }
            Some(rm_badge) => {
                let regions = self
                    .region_maps
                    .get(&rm_badge)
                    .ok_or(ParentError::UnknownHandle(rm_badge))?
                    .regions
                    .clone();
                let mut cursor = offset;
                let end = offset + len;
                while cursor < end {
                    let Some(region) = regions
                        .iter()
                        .find(|r| r.rel_addr <= cursor && cursor < r.rel_addr + r.size)
                    else {
                        return Err(ParentError::Refused(format!(
                            "unresolved fault at {cursor:#x} in {ds}"
                        )));
                    };
                    let span = (region.rel_addr + region.size - cursor).min(end - cursor);
                    let leaf_offset = region.offset + (cursor - region.rel_addr);
                    self.access(region.ds, leaf_offset, span, &mut *apply)?;
                    cursor += span;
                }
                Ok(())
            }
        }
    }
}

/// In-memory parent environment implementing every backend trait.
#[derive(Default)]
pub struct InProcParent {
    inner: Mutex<KernelModel>,
}

impl InProcParent {
    /// Create an empty parent environment.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bundle this environment into a [`Parent`] handle for the engine.
    #[must_use]
    pub fn parent(self: &Arc<Self>) -> Parent {
        Parent {
            pd: Arc::clone(self) as Arc<dyn PdBackend>,
            cpu: Arc::clone(self) as Arc<dyn CpuBackend>,
            ram: Arc::clone(self) as Arc<dyn RamBackend>,
            rm: Arc::clone(self) as Arc<dyn RmBackend>,
            passive: Arc::clone(self) as Arc<dyn PassiveBackend>,
            cap_table: Arc::clone(self) as Arc<dyn CapTableBackend>,
        }
    }

    /// Refuse all subsequent session creations until re-enabled. Used to
    /// exercise the refused-session path.
    pub fn set_refuse_sessions(&self, refuse: bool) {
        self.lock().refuse_sessions = refuse;
    }

    /// Preload the ROM module image handed out for a child label.
    pub fn set_rom_image(&self, label: &str, bytes: &[u8]) {
        self.inner
            .lock()
            .expect("kernel model lock")
            .rom_preload
            .insert(label.to_owned(), bytes.to_vec());
    }

    /// Read the full resolved content of a dataspace.
    pub fn dataspace_bytes(&self, ds: Badge) -> Result<Vec<u8>, ParentError> {
        let mut model = self.inner.lock().expect("kernel model lock");
        let size = model
            .dataspaces
            .get(&ds)
            .ok_or(ParentError::UnknownHandle(ds))?
            .size;
        let mut out = vec![0u8; size as usize];
        let mut cursor = 0usize;
        model.access(ds, 0, size, &mut |bytes, offset, len| {
            out[cursor..cursor + len].copy_from_slice(&bytes[offset..offset + len]);
            cursor += len;
        })?;
        Ok(out)
    }

    /// Remove one capability-table entry of a child, leaving the kernel
    /// object alive. Used to provoke checkpoint consistency failures.
    pub fn remove_cap_entry(&self, label: &str, badge: Badge) {
        let mut model = self.inner.lock().expect("kernel model lock");
        if let Some(table) = model.cap_tables.get_mut(label) {
            table.retain(|(entry, _)| *entry != badge);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KernelModel> {
        self.inner.lock().expect("kernel model lock")
    }
}

impl PdBackend for InProcParent {
    fn create_session(&self, label: &str, args: &str) -> Result<PdHandle, ParentError> {
        let mut model = self.lock();
        model.check_admission()?;
        let session = model.open_session(label, args);
        let area = |model: &mut KernelModel| {
            let handle = model.new_region_map(1 << 30);
            model.register_cap(label, handle.badge);
            model.register_cap(label, handle.ds_badge);
            handle
        };
        let address_space = area(&mut model);
        let stack_area = area(&mut model);
        let linker_area = area(&mut model);
        Ok(PdHandle {
            session,
            address_space,
            stack_area,
            linker_area,
        })
    }

    fn upgrade(&self, session: Badge, args: &str) -> Result<(), ParentError> {
        let mut model = self.lock();
        let extra = crate::args::unsigned_value(args, "ram_quota");
        let object = model
            .sessions
            .get_mut(&session)
            .ok_or(ParentError::UnknownHandle(session))?;
        object.quota += extra;
        Ok(())
    }

    fn close(&self, session: Badge) -> Result<(), ParentError> {
        let mut model = self.lock();
        model
            .sessions
            .remove(&session)
            .ok_or(ParentError::UnknownHandle(session))?;
        model.unregister_cap(session);
        Ok(())
    }

    fn alloc_signal_source(&self, session: Badge) -> Result<Badge, ParentError> {
        let mut model = self.lock();
        let label = model.session_label(session)?;
        let badge = model.alloc_badge();
        model.register_cap(&label, badge);
        Ok(badge)
    }

    fn free_signal_source(&self, _session: Badge, source: Badge) -> Result<(), ParentError> {
        self.lock().unregister_cap(source);
        Ok(())
    }

    fn alloc_context(
        &self,
        session: Badge,
        _source: Badge,
        _imprint: u64,
    ) -> Result<Badge, ParentError> {
        let mut model = self.lock();
        let label = model.session_label(session)?;
        let badge = model.alloc_badge();
        model.register_cap(&label, badge);
        Ok(badge)
    }

    fn free_context(&self, _session: Badge, context: Badge) -> Result<(), ParentError> {
        self.lock().unregister_cap(context);
        Ok(())
    }

    fn submit(&self, _context: Badge, _count: u32) -> Result<(), ParentError> {
        Ok(())
    }

    fn alloc_rpc_cap(&self, session: Badge, _ep: Badge) -> Result<Badge, ParentError> {
        let mut model = self.lock();
        let label = model.session_label(session)?;
        let badge = model.alloc_badge();
        model.register_cap(&label, badge);
        Ok(badge)
    }

    fn free_rpc_cap(&self, _session: Badge, cap: Badge) -> Result<(), ParentError> {
        self.lock().unregister_cap(cap);
        Ok(())
    }

    fn ref_account(&self, _session: Badge, _account: Badge) -> Result<(), ParentError> {
        Ok(())
    }

    fn transfer_quota(&self, session: Badge, to: Badge, amount: u64) -> Result<(), ParentError> {
        let mut model = self.lock();
        let from = model
            .sessions
            .get_mut(&session)
            .ok_or(ParentError::UnknownHandle(session))?;
        if from.quota < amount {
            return Err(ParentError::QuotaExhausted);
        }
        from.quota -= amount;
        if let Some(target) = model.sessions.get_mut(&to) {
            target.quota += amount;
        }
        Ok(())
    }

    fn cap_quota(&self, _session: Badge) -> Result<u64, ParentError> {
        Ok(u64::from(u16::MAX))
    }

    fn used_caps(&self, session: Badge) -> Result<u64, ParentError> {
        let model = self.lock();
        let label = model.session_label(session)?;
        Ok(model
            .cap_tables
            .get(&label)
            .map_or(0, |table| table.len() as u64))
    }

    fn ram_quota(&self, session: Badge) -> Result<u64, ParentError> {
        let model = self.lock();
        model
            .sessions
            .get(&session)
            .map(|object| object.quota)
            .ok_or(ParentError::UnknownHandle(session))
    }

    fn used_ram(&self, _session: Badge) -> Result<u64, ParentError> {
        Ok(0)
    }

    fn alloc(&self, session: Badge, size: u64) -> Result<Badge, ParentError> {
        let mut model = self.lock();
        let label = model.session_label(session)?;
        let badge = model.new_dataspace(size, Backing::Bytes(vec![0u8; size as usize]));
        model.register_cap(&label, badge);
        Ok(badge)
    }

    fn free(&self, _session: Badge, ds: Badge) -> Result<(), ParentError> {
        let mut model = self.lock();
        model
            .dataspaces
            .remove(&ds)
            .ok_or(ParentError::UnknownHandle(ds))?;
        model.unregister_cap(ds);
        Ok(())
    }

    fn dataspace_size(&self, ds: Badge) -> Result<u64, ParentError> {
        let model = self.lock();
        model
            .dataspaces
            .get(&ds)
            .map(|space| space.size)
            .ok_or(ParentError::UnknownHandle(ds))
    }

    fn map(&self, _session: Badge, _virt: u64, _size: u64) -> Result<(), ParentError> {
        Ok(())
    }

    fn assign_parent(&self, _session: Badge, _parent: Badge) -> Result<(), ParentError> {
        Ok(())
    }

    fn assign_pci(&self, _session: Badge, _addr: u64, _bdf: u16) -> Result<bool, ParentError> {
        Ok(true)
    }
}

impl CpuBackend for InProcParent {
    fn create_session(&self, label: &str, args: &str) -> Result<Badge, ParentError> {
        let mut model = self.lock();
        model.check_admission()?;
        Ok(model.open_session(label, args))
    }

    fn upgrade(&self, session: Badge, args: &str) -> Result<(), ParentError> {
        PdBackend::upgrade(self, session, args)
    }

    fn close(&self, session: Badge) -> Result<(), ParentError> {
        PdBackend::close(self, session)
    }

    fn create_thread(
        &self,
        session: Badge,
        pd: Badge,
        _name: &str,
        _affinity: AffinityLocation,
        _weight: u64,
        _utcb: u64,
    ) -> Result<Badge, ParentError> {
        let mut model = self.lock();
        if !model.sessions.contains_key(&pd) {
            return Err(ParentError::UnknownHandle(pd));
        }
        let label = model.session_label(session)?;
        let badge = model.alloc_badge();
        model.threads.insert(badge, Thread::default());
        model.register_cap(&label, badge);
        Ok(badge)
    }

    fn create_fp_edf_thread(
        &self,
        session: Badge,
        pd: Badge,
        name: &str,
        affinity: AffinityLocation,
        weight: u64,
        utcb: u64,
        _priority: u32,
        _deadline: u32,
    ) -> Result<Badge, ParentError> {
        self.create_thread(session, pd, name, affinity, weight, utcb)
    }

    fn kill_thread(&self, thread: Badge) -> Result<(), ParentError> {
        let mut model = self.lock();
        model
            .threads
            .remove(&thread)
            .ok_or(ParentError::UnknownHandle(thread))?;
        model.unregister_cap(thread);
        Ok(())
    }

    fn start_thread(&self, thread: Badge, ip: u64, sp: u64) -> Result<(), ParentError> {
        let mut model = self.lock();
        let object = model
            .threads
            .get_mut(&thread)
            .ok_or(ParentError::UnknownHandle(thread))?;
        object.registers.ip = ip;
        object.registers.sp = sp;
        Ok(())
    }

    fn pause_thread(&self, thread: Badge) -> Result<(), ParentError> {
        let mut model = self.lock();
        let object = model
            .threads
            .get_mut(&thread)
            .ok_or(ParentError::UnknownHandle(thread))?;
        object.paused = true;
        Ok(())
    }

    fn resume_thread(&self, thread: Badge) -> Result<(), ParentError> {
        let mut model = self.lock();
        let object = model
            .threads
            .get_mut(&thread)
            .ok_or(ParentError::UnknownHandle(thread))?;
        object.paused = false;
        Ok(())
    }

    fn single_step(&self, thread: Badge, _enabled: bool) -> Result<(), ParentError> {
        let model = self.lock();
        if !model.threads.contains_key(&thread) {
            return Err(ParentError::UnknownHandle(thread));
        }
        Ok(())
    }

    fn thread_state(&self, thread: Badge) -> Result<ThreadRegisters, ParentError> {
        let model = self.lock();
        let object = model
            .threads
            .get(&thread)
            .ok_or(ParentError::UnknownHandle(thread))?;
        if !object.paused {
            // Registers of a running thread are a best-effort snapshot.
            trace!("thread_state of running thread {thread}");
        }
        Ok(object.registers)
    }

    fn set_sched_type(&self, _core: u32, _sched_type: u32) -> Result<i32, ParentError> {
        Ok(0)
    }

    fn get_sched_type(&self, _core: u32) -> Result<i32, ParentError> {
        Ok(0)
    }

    fn deploy_queue(&self, _ds: Badge) -> Result<(), ParentError> {
        Ok(())
    }

    fn rq(&self, _ds: Badge) -> Result<(), ParentError> {
        Ok(())
    }

    fn dead(&self, _ds: Badge) -> Result<(), ParentError> {
        Ok(())
    }

    fn killed(&self) -> Result<(), ParentError> {
        Ok(())
    }
}

impl RamBackend for InProcParent {
    fn create_session(&self, label: &str, args: &str) -> Result<Badge, ParentError> {
        let mut model = self.lock();
        model.check_admission()?;
        Ok(model.open_session(label, args))
    }

    fn upgrade(&self, session: Badge, args: &str) -> Result<(), ParentError> {
        PdBackend::upgrade(self, session, args)
    }

    fn close(&self, session: Badge) -> Result<(), ParentError> {
        PdBackend::close(self, session)
    }

    fn alloc(&self, session: Badge, size: u64, _cached: bool) -> Result<Badge, ParentError> {
        let mut model = self.lock();
        let badge = model.new_dataspace(size, Backing::Bytes(vec![0u8; size as usize]));
        if session != Badge::HOST {
            let label = model.session_label(session)?;
            model.register_cap(&label, badge);
        }
        Ok(badge)
    }

    fn free(&self, _session: Badge, ds: Badge) -> Result<(), ParentError> {
        let mut model = self.lock();
        model
            .dataspaces
            .remove(&ds)
            .ok_or(ParentError::UnknownHandle(ds))?;
        model.unregister_cap(ds);
        Ok(())
    }

    fn size(&self, ds: Badge) -> Result<u64, ParentError> {
        PdBackend::dataspace_size(self, ds)
    }

    fn read(&self, ds: Badge, offset: u64, buf: &mut [u8]) -> Result<(), ParentError> {
        let mut model = self.lock();
        let mut cursor = 0usize;
        model.access(ds, offset, buf.len() as u64, &mut |bytes, start, len| {
            buf[cursor..cursor + len].copy_from_slice(&bytes[start..start + len]);
            cursor += len;
        })
    }

    fn write(&self, ds: Badge, offset: u64, data: &[u8]) -> Result<(), ParentError> {
        let mut model = self.lock();
        let mut cursor = 0usize;
        model.access(ds, offset, data.len() as u64, &mut |bytes, start, len| {
            bytes[start..start + len].copy_from_slice(&data[cursor..cursor + len]);
            cursor += len;
        })
    }

    fn copy(
        &self,
        src: Badge,
        src_offset: u64,
        dst: Badge,
        dst_offset: u64,
        len: u64,
    ) -> Result<(), ParentError> {
        let mut model = self.lock();
        let mut scratch = vec![0u8; len as usize];
        let mut cursor = 0usize;
        model.access(src, src_offset, len, &mut |bytes, start, span| {
            scratch[cursor..cursor + span].copy_from_slice(&bytes[start..start + span]);
            cursor += span;
        })?;
        let mut cursor = 0usize;
        model.access(dst, dst_offset, len, &mut |bytes, start, span| {
            bytes[start..start + span].copy_from_slice(&scratch[cursor..cursor + span]);
            cursor += span;
        })
    }
}

impl RmBackend for InProcParent {
    fn create_session(&self, label: &str, args: &str) -> Result<Badge, ParentError> {
        let mut model = self.lock();
        model.check_admission()?;
        Ok(model.open_session(label, args))
    }

    fn upgrade(&self, session: Badge, args: &str) -> Result<(), ParentError> {
        PdBackend::upgrade(self, session, args)
    }

    fn close(&self, session: Badge) -> Result<(), ParentError> {
        PdBackend::close(self, session)
    }

    fn create_region_map(&self, session: Badge, size: u64) -> Result<RegionMapHandle, ParentError> {
        let mut model = self.lock();
        let label = model.session_label(session)?;
        let handle = model.new_region_map(size);
        model.register_cap(&label, handle.badge);
        model.register_cap(&label, handle.ds_badge);
        Ok(handle)
    }

    fn destroy_region_map(&self, rm: Badge) -> Result<(), ParentError> {
        let mut model = self.lock();
        let map = model
            .region_maps
            .remove(&rm)
            .ok_or(ParentError::UnknownHandle(rm))?;
        model.dataspaces.remove(&map.ds_badge);
        model.unregister_cap(map.ds_badge);
        model.unregister_cap(rm);
        Ok(())
    }

    fn attach(
        &self,
        rm: Badge,
        ds: Badge,
        size: u64,
        offset: u64,
        local_addr: u64,
        _executable: bool,
        use_local_addr: bool,
    ) -> Result<u64, ParentError> {
        let mut model = self.lock();
        if !model.dataspaces.contains_key(&ds) {
            return Err(ParentError::UnknownHandle(ds));
        }
        let map = model
            .region_maps
            .get_mut(&rm)
            .ok_or(ParentError::UnknownHandle(rm))?;
        let rel_addr = if use_local_addr {
            local_addr
        } else {
            let addr = map.next_addr;
            map.next_addr += size.next_multiple_of(0x1000);
            addr
        };
        if rel_addr + size > map.size {
            return Err(ParentError::Refused(format!(
                "attachment {rel_addr:#x}+{size:#x} exceeds region map"
            )));
        }
        let overlaps = map.regions.iter().any(|region| {
            rel_addr < region.rel_addr + region.size && region.rel_addr < rel_addr + size
        });
        if overlaps {
            return Err(ParentError::Refused(format!(
                "attachment at {rel_addr:#x} overlaps existing region"
            )));
        }
        map.regions.push(Region {
            rel_addr,
            size,
            ds,
            offset,
        });
        Ok(rel_addr)
    }

    fn detach(&self, rm: Badge, rel_addr: u64) -> Result<(), ParentError> {
        let mut model = self.lock();
        let map = model
            .region_maps
            .get_mut(&rm)
            .ok_or(ParentError::UnknownHandle(rm))?;
        let before = map.regions.len();
        map.regions.retain(|region| region.rel_addr != rel_addr);
        if map.regions.len() == before {
            return Err(ParentError::Refused(format!(
                "no region attached at {rel_addr:#x}"
            )));
        }
        Ok(())
    }

    fn fault_handler(&self, rm: Badge, _sigh: Badge) -> Result<(), ParentError> {
        let model = self.lock();
        if !model.region_maps.contains_key(&rm) {
            return Err(ParentError::UnknownHandle(rm));
        }
        Ok(())
    }

    fn state(&self, rm: Badge) -> Result<FaultState, ParentError> {
        let model = self.lock();
        if !model.region_maps.contains_key(&rm) {
            return Err(ParentError::UnknownHandle(rm));
        }
        Ok(FaultState::default())
    }
}

impl PassiveBackend for InProcParent {
    fn create_session(
        &self,
        kind: PassiveKind,
        label: &str,
        args: &str,
    ) -> Result<Badge, ParentError> {
        let mut model = self.lock();
        model.check_admission()?;
        let session = model.open_session(label, args);
        if kind == PassiveKind::Rom {
            let image = model
                .rom_preload
                .get(label)
                .cloned()
                .unwrap_or_else(|| b"amber module image".to_vec());
            let size = image.len() as u64;
            let ds = model.new_dataspace(size, Backing::Bytes(image));
            model.register_cap(label, ds);
            model.rom_images.insert(session, ds);
        }
        Ok(session)
    }

    fn upgrade(&self, session: Badge, args: &str) -> Result<(), ParentError> {
        PdBackend::upgrade(self, session, args)
    }

    fn close(&self, session: Badge) -> Result<(), ParentError> {
        PdBackend::close(self, session)
    }

    fn rom_dataspace(&self, session: Badge) -> Result<(Badge, u64), ParentError> {
        let model = self.lock();
        let ds = *model
            .rom_images
            .get(&session)
            .ok_or(ParentError::UnknownHandle(session))?;
        let size = model
            .dataspaces
            .get(&ds)
            .map(|space| space.size)
            .ok_or(ParentError::UnknownHandle(ds))?;
        Ok((ds, size))
    }
}

impl CapTableBackend for InProcParent {
    fn read_cap_table(&self, label: &str) -> Result<Vec<(Badge, Kcap)>, ParentError> {
        Ok(self
            .lock()
            .cap_tables
            .get(label)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_backed_dataspace_resolves_through_attachments() {
        let parent = InProcParent::new();
        let session = {
            let mut model = parent.lock();
            model.open_session("t", "ram_quota=0")
        };
        let handle = RmBackend::create_region_map(parent.as_ref(), session, 0x2000).unwrap();
        let chunk = RamBackend::alloc(parent.as_ref(), Badge::HOST, 0x1000, false).unwrap();
        RmBackend::attach(parent.as_ref(), handle.badge, chunk, 0x1000, 0, 0x1000, false, true)
            .unwrap();
        RamBackend::write(parent.as_ref(), handle.ds_badge, 0x1234, &[0xAB]).unwrap();
        let mut byte = [0u8; 1];
        RamBackend::read(parent.as_ref(), chunk, 0x234, &mut byte).unwrap();
        assert_eq!(byte[0], 0xAB);
    }

    #[test]
    fn unattached_access_faults() {
        let parent = InProcParent::new();
        let session = {
            let mut model = parent.lock();
            model.open_session("t", "ram_quota=0")
        };
        let handle = RmBackend::create_region_map(parent.as_ref(), session, 0x2000).unwrap();
        let err = RamBackend::write(parent.as_ref(), handle.ds_badge, 0, &[1]).unwrap_err();
        assert!(matches!(err, ParentError::Refused(_)));
    }

    #[test]
    fn cap_table_tracks_alloc_and_free() {
        let parent = InProcParent::new();
        let handle = PdBackend::create_session(parent.as_ref(), "child", "ram_quota=4096").unwrap();
        let source = PdBackend::alloc_signal_source(parent.as_ref(), handle.session).unwrap();
        let table = CapTableBackend::read_cap_table(parent.as_ref(), "child").unwrap();
        assert!(table.iter().any(|(badge, _)| *badge == source));
        PdBackend::free_signal_source(parent.as_ref(), handle.session, source).unwrap();
        let table = CapTableBackend::read_cap_table(parent.as_ref(), "child").unwrap();
        assert!(!table.iter().any(|(badge, _)| *badge == source));
    }
}
