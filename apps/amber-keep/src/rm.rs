// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Shadow region maps and the interposed RM session.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex};

use amber_wire::Badge;
use log::warn;

use crate::child::{ChildRecord, ChildRegistry};
use crate::parent::{FaultState, Parent, RegionMapHandle, RmBackend};
use crate::session::{readjusted_args, SessionMeta};
use crate::{args, EngineError, ServiceKind};

/// One region attached into a shadow region map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachedRegion {
    /// Badge of the attached dataspace.
    pub ds_badge: Badge,
    /// Relative address the parent placed the region at.
    pub rel_addr: u64,
    /// Size of the attached window in bytes.
    pub size: u64,
    /// Offset into the attached dataspace.
    pub offset: u64,
    /// Whether the region is mapped executable.
    pub executable: bool,
}

/// Shadow of one virtual address-space object. Interposes `attach`,
/// `detach`, `fault_handler`, and `state`; every attach that the parent
/// accepts is mirrored by an attached-region record keyed by the relative
/// address the parent returned.
pub struct RegionMapShadow {
    badge: Badge,
    ds_badge: Badge,
    bootstrapped: bool,
    rm: Arc<dyn RmBackend>,
    sigh: Mutex<Badge>,
    attached: Mutex<Vec<AttachedRegion>>,
}

impl RegionMapShadow {
    pub(crate) fn new(handle: RegionMapHandle, bootstrapped: bool, rm: Arc<dyn RmBackend>) -> Self {
        Self {
            badge: handle.badge,
            ds_badge: handle.ds_badge,
            bootstrapped,
            rm,
            sigh: Mutex::new(Badge::HOST),
            attached: Mutex::new(Vec::new()),
        }
    }

    /// Badge of the region-map capability.
    #[must_use]
    pub fn badge(&self) -> Badge {
        self.badge
    }

    /// Badge of the dataspace backing this region map.
    #[must_use]
    pub fn ds_badge(&self) -> Badge {
        self.ds_badge
    }

    /// Whether the map was created during the child's bootstrap phase.
    #[must_use]
    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Attach a dataspace window. When `use_local_addr` is clear the record
    /// uses whatever address the real region map returns.
    pub fn attach(
        &self,
        ds: Badge,
        size: u64,
        offset: u64,
        local_addr: u64,
        executable: bool,
        use_local_addr: bool,
    ) -> Result<u64, EngineError> {
        let rel_addr = self.rm.attach(
            self.badge,
            ds,
            size,
            offset,
            local_addr,
            executable,
            use_local_addr,
        )?;
        let mut attached = self.attached.lock().expect("attached regions lock");
        debug_assert!(
            attached.iter().all(|region| region.rel_addr != rel_addr),
            "parent attached two regions at the same address"
        );
        attached.push(AttachedRegion {
            ds_badge: ds,
            rel_addr,
            size,
            offset,
            executable,
        });
        Ok(rel_addr)
    }

    /// Detach the region at `rel_addr`, removing its record.
    pub fn detach(&self, rel_addr: u64) -> Result<(), EngineError> {
        let mut attached = self.attached.lock().expect("attached regions lock");
        let Some(index) = attached.iter().position(|r| r.rel_addr == rel_addr) else {
            warn!("detach at {rel_addr:#x} matches no attached region of {}", self.badge);
            return Ok(());
        };
        self.rm.detach(self.badge, rel_addr)?;
        attached.remove(index);
        Ok(())
    }

    /// Install a fault handler and remember its badge for the snapshot.
    pub fn fault_handler(&self, sigh: Badge) -> Result<(), EngineError> {
        self.rm.fault_handler(self.badge, sigh)?;
        *self.sigh.lock().expect("sigh lock") = sigh;
        Ok(())
    }

    /// Query the fault state of the real region map.
    pub fn state(&self) -> Result<FaultState, EngineError> {
        Ok(self.rm.state(self.badge)?)
    }

    pub(crate) fn sigh(&self) -> Badge {
        *self.sigh.lock().expect("sigh lock")
    }

    /// Snapshot reference of the attached-region list.
    pub(crate) fn attached_regions(&self) -> Vec<AttachedRegion> {
        self.attached.lock().expect("attached regions lock").clone()
    }
}

/// Interposed RM session: a factory of additional shadow region maps.
pub struct RmSession {
    meta: SessionMeta,
    child: Arc<ChildRecord>,
    rm: Arc<dyn RmBackend>,
    region_maps: Mutex<Vec<Arc<RegionMapShadow>>>,
    destroyed_maps: Mutex<VecDeque<Badge>>,
}

impl RmSession {
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

    /// Create a region map of the given size on behalf of the child.
    pub fn create_region_map(&self, size: u64) -> Result<Arc<RegionMapShadow>, EngineError> {
        let handle = self.rm.create_region_map(self.meta.badge(), size)?;
        let map = Arc::new(RegionMapShadow::new(
            handle,
            self.child.bootstrapped(),
            Arc::clone(&self.rm),
        ));
        self.region_maps
            .lock()
            .expect("region maps lock")
            .push(Arc::clone(&map));
        Ok(map)
    }

    /// Mark a region map for destruction; the record is reclaimed at the
    /// next checkpoint.
    pub fn destroy_region_map(&self, badge: Badge) -> Result<(), EngineError> {
        let maps = self.region_maps.lock().expect("region maps lock");
        if !maps.iter().any(|map| map.badge() == badge) {
            return Err(EngineError::UnknownBadge(badge));
        }
        drop(maps);
        self.destroyed_maps
            .lock()
            .expect("destroyed maps lock")
            .push_back(badge);
        Ok(())
    }

    /// Look up a shadow region map by badge.
    #[must_use]
    pub fn find_region_map(&self, badge: Badge) -> Option<Arc<RegionMapShadow>> {
        self.region_maps
            .lock()
            .expect("region maps lock")
            .iter()
            .find(|map| map.badge() == badge)
            .cloned()
    }

    /// Snapshot reference of the live region-map list.
    pub(crate) fn region_maps(&self) -> Vec<Arc<RegionMapShadow>> {
        self.region_maps.lock().expect("region maps lock").clone()
    }

    /// Drain the destruction FIFO, removing reclaimed maps from the live
    /// list. Runs only inside `checkpoint()`.
    pub(crate) fn drain_destroyed(&self) {
        let drained: Vec<Badge> = {
            let mut fifo = self.destroyed_maps.lock().expect("destroyed maps lock");
            mem::take(&mut *fifo).into()
        };
        if drained.is_empty() {
            return;
        }
        let mut maps = self.region_maps.lock().expect("region maps lock");
        maps.retain(|map| {
            if !drained.contains(&map.badge()) {
                return true;
            }
            if let Err(err) = self.rm.destroy_region_map(map.badge()) {
                warn!("destroy of region map {} failed: {err}", map.badge());
            }
            false
        });
    }
}

/// Factory root for interposed RM sessions.
pub struct RmRoot {
    parent: Parent,
    registry: Arc<ChildRegistry>,
    sessions: Mutex<Vec<Arc<RmSession>>>,
    destroyed: Mutex<VecDeque<Badge>>,
}

impl RmRoot {
    pub(crate) fn new(parent: Parent, registry: Arc<ChildRegistry>) -> Self {
        Self {
            parent,
            registry,
            sessions: Mutex::new(Vec::new()),
            destroyed: Mutex::new(VecDeque::new()),
        }
    }

    /// Create an RM session from the child's creation-argument string.
    pub fn create_session(&self, creation_args: &str) -> Result<Arc<RmSession>, EngineError> {
        let label = args::string_value(creation_args, "label")
            .unwrap_or_default()
            .to_owned();
        let adjusted = readjusted_args(creation_args, mem::size_of::<RmSession>() as u64);
        let child = self.registry.find_or_create(&label);
        let badge = self
            .parent
            .rm
            .create_session(&label, &adjusted)
            .map_err(|err| EngineError::refused(ServiceKind::Rm, err))?;
        let session = Arc::new(RmSession {
            meta: SessionMeta::new(badge, creation_args, child.bootstrapped()),
            child: Arc::clone(&child),
            rm: Arc::clone(&self.parent.rm),
            region_maps: Mutex::new(Vec::new()),
            destroyed_maps: Mutex::new(VecDeque::new()),
        });
        self.sessions
            .lock()
            .expect("rm sessions lock")
            .push(Arc::clone(&session));
        child.sessions.lock().expect("session slots lock").rm = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Upgrade a session, forwarding the upgrade string verbatim.
    pub fn upgrade(&self, badge: Badge, upgrade_args: &str) -> Result<(), EngineError> {
        let session = self
            .find_by_badge(badge)
            .ok_or(EngineError::UnknownBadge(badge))?;
        self.parent
            .rm
            .upgrade(badge, upgrade_args)
            .map_err(|err| EngineError::refused(ServiceKind::Rm, err))?;
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
    pub fn find_by_badge(&self, badge: Badge) -> Option<Arc<RmSession>> {
        self.sessions
            .lock()
            .expect("rm sessions lock")
            .iter()
            .find(|session| session.meta.badge() == badge)
            .cloned()
    }

    /// Snapshot reference of the live session list.
    pub(crate) fn sessions(&self) -> Vec<Arc<RmSession>> {
        self.sessions.lock().expect("rm sessions lock").clone()
    }

    /// Drain destroyed sessions and each session's destroyed region maps.
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
        let mut sessions = self.sessions.lock().expect("rm sessions lock");
        sessions.retain(|session| {
            if !drained.contains(&session.meta.badge()) {
                return true;
            }
            if let Err(err) = self.parent.rm.close(session.meta.badge()) {
                warn!("parent rm close failed for {}: {err}", session.meta.badge());
            }
            session.child.sessions.lock().expect("session slots lock").rm = None;
            false
        });
    }
}
