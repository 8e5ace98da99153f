// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Interposed RAM session with granularity-managed dataspaces.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex};

use amber_wire::Badge;
use log::{debug, warn};

use crate::child::{ChildRecord, ChildRegistry};
use crate::parent::{Parent, RamBackend, RmBackend};
use crate::session::{readjusted_args, SessionMeta};
use crate::{args, EngineError, ServiceKind};

/// One designated sub-dataspace of a managed dataspace. A sub is attached
/// into the managing region map only when the child first touches it; being
/// attached at checkpoint time is what marks the sub as modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DesignatedSub {
    /// Badge of the sub-dataspace holding the chunk's bytes.
    pub badge: Badge,
    /// Offset of the chunk inside the managed dataspace.
    pub rel_addr: u64,
    /// Chunk size; the managed granularity except possibly for the tail.
    pub size: u64,
    /// Whether the sub is currently attached, i.e. touched since the last
    /// checkpoint.
    pub attached: bool,
}

/// Bookkeeping of a granularity-managed dataspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedDataspace {
    /// Badge of the region map implementing the dataspace.
    pub rm_badge: Badge,
    /// Chunk granularity in bytes.
    pub granularity: u64,
    /// The designated sub-dataspaces in address order.
    pub subs: Vec<DesignatedSub>,
}

/// Shadow of one RAM dataspace the child allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataspaceRecord {
    /// Badge of the dataspace capability the child holds.
    pub badge: Badge,
    /// Size in bytes.
    pub size: u64,
    /// Whether the dataspace was allocated cached.
    pub cached: bool,
    /// Whether the dataspace was allocated during the bootstrap phase.
    pub bootstrapped: bool,
    /// Present when the dataspace is granularity-managed.
    pub managed: Option<ManagedDataspace>,
}

/// Interposed RAM session. Allocations are forwarded to the parent; with a
/// non-zero granularity each allocation is materialised as a managed
/// dataspace whose sub-ranges attach lazily on first touch, enabling
/// incremental checkpoints.
pub struct RamSession {
    meta: SessionMeta,
    child: Arc<ChildRecord>,
    ram: Arc<dyn RamBackend>,
    rm: Arc<dyn RmBackend>,
    granularity: u64,
    dataspaces: Mutex<Vec<DataspaceRecord>>,
    destroyed_dataspaces: Mutex<VecDeque<Badge>>,
}

impl RamSession {
    /// Common session fields.
    #[must_use]
    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    /// Label of the owning child.
    #[must_use]
    pub fn child_label(&self) -> String {
        self.child.label().to_owned()
    }

    /// Allocate a dataspace of `size` bytes.
    pub fn alloc(&self, size: u64, cached: bool) -> Result<Badge, EngineError> {
        let record = if self.granularity == 0 {
            let badge = self.ram.alloc(self.meta.badge(), size, cached)?;
            DataspaceRecord {
                badge,
                size,
                cached,
                bootstrapped: self.child.bootstrapped(),
                managed: None,
            }
        } else {
            self.alloc_managed(size, cached)?
        };
        let badge = record.badge;
        self.dataspaces
            .lock()
            .expect("dataspaces lock")
            .push(record);
        Ok(badge)
    }

    /// Build a managed dataspace: a region map whose dataspace the child
    /// receives, with one pre-allocated sub-dataspace per granularity chunk.
    /// Subs are engine-owned and attach only when the child faults on them.
    fn alloc_managed(&self, size: u64, cached: bool) -> Result<DataspaceRecord, EngineError> {
        let handle = self.rm.create_region_map(self.meta.badge(), size)?;
        let mut subs = Vec::new();
        let mut rel_addr = 0;
        while rel_addr < size {
            let chunk = self.granularity.min(size - rel_addr);
            let badge = self.ram.alloc(Badge::HOST, chunk, cached)?;
            subs.push(DesignatedSub {
                badge,
                rel_addr,
                size: chunk,
                attached: false,
            });
            rel_addr += chunk;
        }
        debug!(
            "managed dataspace {} for child {}: {} subs of {:#x} bytes",
            handle.ds_badge,
            self.child.label(),
            subs.len(),
            self.granularity
        );
        Ok(DataspaceRecord {
            badge: handle.ds_badge,
            size,
            cached,
            bootstrapped: self.child.bootstrapped(),
            managed: Some(ManagedDataspace {
                rm_badge: handle.badge,
                granularity: self.granularity,
                subs,
            }),
        })
    }

    /// Free a dataspace: forward, then enqueue the shadow for destruction at
    /// the next checkpoint.
    pub fn free(&self, badge: Badge) -> Result<(), EngineError> {
        let dataspaces = self.dataspaces.lock().expect("dataspaces lock");
        let Some(record) = dataspaces.iter().find(|record| record.badge == badge) else {
            return Err(EngineError::UnknownBadge(badge));
        };
        if record.managed.is_none() {
            self.ram.free(self.meta.badge(), badge)?;
        }
        drop(dataspaces);
        self.destroyed_dataspaces
            .lock()
            .expect("destroyed dataspaces lock")
            .push_back(badge);
        Ok(())
    }

    /// Page-fault entry for managed dataspaces: attach the designated sub
    /// covering `addr` so the child's access can complete, marking the sub
    /// as touched for the next checkpoint.
    pub fn handle_fault(&self, ds_badge: Badge, addr: u64) -> Result<(), EngineError> {
        let mut dataspaces = self.dataspaces.lock().expect("dataspaces lock");
        let Some(record) = dataspaces.iter_mut().find(|record| record.badge == ds_badge) else {
            return Err(EngineError::UnknownBadge(ds_badge));
        };
        let Some(managed) = record.managed.as_mut() else {
            return Err(EngineError::UnknownBadge(ds_badge));
        };
        let Some(sub) = managed
            .subs
            .iter_mut()
            .find(|sub| sub.rel_addr <= addr && addr < sub.rel_addr + sub.size)
        else {
            warn!("fault at {addr:#x} outside managed dataspace {ds_badge}");
            return Ok(());
        };
        if sub.attached {
            return Ok(());
        }
        self.rm
            .attach(managed.rm_badge, sub.badge, sub.size, 0, sub.rel_addr, false, true)?;
        sub.attached = true;
        Ok(())
    }

    /// Snapshot reference of the live dataspace list.
    pub(crate) fn dataspaces(&self) -> Vec<DataspaceRecord> {
        self.dataspaces.lock().expect("dataspaces lock").clone()
    }

    /// Detach every attached designated sub so subsequent child faults mark
    /// their chunks as modified again. Runs only inside `checkpoint()`.
    pub(crate) fn detach_designated(&self) -> Result<(), EngineError> {
        let mut dataspaces = self.dataspaces.lock().expect("dataspaces lock");
        for record in dataspaces.iter_mut() {
            let Some(managed) = record.managed.as_mut() else {
                continue;
            };
            for sub in managed.subs.iter_mut().filter(|sub| sub.attached) {
                self.rm.detach(managed.rm_badge, sub.rel_addr)?;
                sub.attached = false;
            }
        }
        Ok(())
    }

    /// Drain the destruction FIFO, removing reclaimed dataspaces from the
    /// live list and releasing managed sub storage. Runs only inside
    /// `checkpoint()`.
    pub(crate) fn drain_destroyed(&self) {
        let drained: Vec<Badge> = {
            let mut fifo = self
                .destroyed_dataspaces
                .lock()
                .expect("destroyed dataspaces lock");
            mem::take(&mut *fifo).into()
        };
        if drained.is_empty() {
            return;
        }
        let mut dataspaces = self.dataspaces.lock().expect("dataspaces lock");
        dataspaces.retain(|record| {
            if !drained.contains(&record.badge) {
                return true;
            }
            if let Some(managed) = &record.managed {
                for sub in &managed.subs {
                    if sub.attached {
                        if let Err(err) = self.rm.detach(managed.rm_badge, sub.rel_addr) {
                            warn!("detach of freed sub {} failed: {err}", sub.badge);
                        }
                    }
                    if let Err(err) = self.ram.free(Badge::HOST, sub.badge) {
                        warn!("free of designated sub {} failed: {err}", sub.badge);
                    }
                }
                if let Err(err) = self.rm.destroy_region_map(managed.rm_badge) {
                    warn!("destroy of managing region map {} failed: {err}", managed.rm_badge);
                }
            }
            false
        });
    }
}

/// Factory root for interposed RAM sessions.
pub struct RamRoot {
    parent: Parent,
    registry: Arc<ChildRegistry>,
    granularity: u64,
    sessions: Mutex<Vec<Arc<RamSession>>>,
    destroyed: Mutex<VecDeque<Badge>>,
}

impl RamRoot {
    pub(crate) fn new(parent: Parent, registry: Arc<ChildRegistry>, granularity: u64) -> Self {
        Self {
            parent,
            registry,
            granularity,
            sessions: Mutex::new(Vec::new()),
            destroyed: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a RAM session from the child's creation-argument string.
    pub fn create_session(&self, creation_args: &str) -> Result<Arc<RamSession>, EngineError> {
        let label = args::string_value(creation_args, "label")
            .unwrap_or_default()
            .to_owned();
        let adjusted = readjusted_args(creation_args, mem::size_of::<RamSession>() as u64);
        let child = self.registry.find_or_create(&label);
        let badge = self
            .parent
            .ram
            .create_session(&label, &adjusted)
            .map_err(|err| EngineError::refused(ServiceKind::Ram, err))?;
        let session = Arc::new(RamSession {
            meta: SessionMeta::new(badge, creation_args, child.bootstrapped()),
            child: Arc::clone(&child),
            ram: Arc::clone(&self.parent.ram),
            rm: Arc::clone(&self.parent.rm),
            granularity: self.granularity,
            dataspaces: Mutex::new(Vec::new()),
            destroyed_dataspaces: Mutex::new(VecDeque::new()),
        });
        self.sessions
            .lock()
            .expect("ram sessions lock")
            .push(Arc::clone(&session));
        child.sessions.lock().expect("session slots lock").ram = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Upgrade a session, forwarding the upgrade string verbatim.
    pub fn upgrade(&self, badge: Badge, upgrade_args: &str) -> Result<(), EngineError> {
        let session = self
            .find_by_badge(badge)
            .ok_or(EngineError::UnknownBadge(badge))?;
        self.parent
            .ram
            .upgrade(badge, upgrade_args)
            .map_err(|err| EngineError::refused(ServiceKind::Ram, err))?;
        session.meta.apply_upgrade(upgrade_args);
        Ok(())
    }

    /// Mark a session for removal; reclamation happens at the next
    /// checkpoint.
    pub fn destroy(&self, badge: Badge) -> Result<(), EngineError> {
        if self.find_by_badge(badge).is_none() {
            return Err(EngineError::UnknownBadge(badge));
        }
        self.destroyed
            .lock()
            .expect("destroyed sessions lock")
            .push_back(badge);
        Ok(())
    }

    /// Look up a session by its capability badge.
    #[must_use]
    pub fn find_by_badge(&self, badge: Badge) -> Option<Arc<RamSession>> {
        self.sessions
            .lock()
            .expect("ram sessions lock")
            .iter()
            .find(|session| session.meta.badge() == badge)
            .cloned()
    }

    /// Snapshot reference of the live session list.
    pub(crate) fn sessions(&self) -> Vec<Arc<RamSession>> {
        self.sessions.lock().expect("ram sessions lock").clone()
    }

    /// Drain destroyed sessions and each session's destroyed dataspaces.
    /// Runs only inside `checkpoint()`.
    pub(crate) fn drain_destroyed(&self) {
        for session in self.sessions() {
            session.drain_destroyed();
        }
        let drained: Vec<Badge> = {
            let mut fifo = self.destroyed.lock().expect("destroyed sessions lock");
            mem::take(&mut *fifo).into()
        };
        if drained.is_empty() {
            return;
        }
        let mut sessions = self.sessions.lock().expect("ram sessions lock");
        sessions.retain(|session| {
            if !drained.contains(&session.meta.badge()) {
                return true;
            }
            if let Err(err) = self.parent.ram.close(session.meta.badge()) {
                warn!("parent ram close failed for {}: {err}", session.meta.badge());
            }
            session.child.sessions.lock().expect("session slots lock").ram = None;
            false
        });
    }
}
