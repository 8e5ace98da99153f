// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Interposed protection-domain session and its factory root.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex};

use amber_wire::Badge;
use log::{debug, warn};

use crate::child::{ChildRecord, ChildRegistry};
use crate::parent::{Parent, PdBackend};
use crate::rm::RegionMapShadow;
use crate::session::{readjusted_args, SessionMeta};
use crate::{args, EngineError, ServiceKind};

/// Shadow of a signal source the child allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalSourceRecord {
    /// Badge of the signal-source capability.
    pub badge: Badge,
    /// Whether the source was allocated during the bootstrap phase.
    pub bootstrapped: bool,
}

/// Shadow of a signal context the child allocated. Both the source badge and
/// the imprint are required for faithful replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalContextRecord {
    /// Badge of the signal-context capability.
    pub badge: Badge,
    /// Badge of the signal source the context is bound to.
    pub source_badge: Badge,
    /// Imprint delivered with every signal.
    pub imprint: u64,
    /// Whether the context was allocated during the bootstrap phase.
    pub bootstrapped: bool,
}

/// Shadow of a native RPC capability the child allocated. The kernel reuses
/// the endpoint badge across allocations, so lookups for `free_rpc_cap` key
/// on the endpoint badge, not the capability badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeCapRecord {
    /// Badge of the allocated capability.
    pub badge: Badge,
    /// Badge of the entrypoint the capability was allocated for.
    pub ep_badge: Badge,
    /// Whether the capability was allocated during the bootstrap phase.
    pub bootstrapped: bool,
}

/// Interposed PD session. Owns the three standard region maps and shadows
/// every signal source, signal context, and native RPC capability the child
/// allocates through it.
pub struct PdSession {
    meta: SessionMeta,
    child: Arc<ChildRecord>,
    pd: Arc<dyn PdBackend>,
    parent_pd: Badge,
    address_space: Arc<RegionMapShadow>,
    stack_area: Arc<RegionMapShadow>,
    linker_area: Arc<RegionMapShadow>,
    signal_sources: Mutex<Vec<SignalSourceRecord>>,
    destroyed_sources: Mutex<VecDeque<Badge>>,
    signal_contexts: Mutex<Vec<SignalContextRecord>>,
    destroyed_contexts: Mutex<VecDeque<Badge>>,
    native_caps: Mutex<Vec<NativeCapRecord>>,
    destroyed_native_caps: Mutex<VecDeque<Badge>>,
}

impl std::fmt::Debug for PdSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdSession")
            .field("parent_pd", &self.parent_pd)
            .finish_non_exhaustive()
    }
}

impl PdSession {
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

    /// Badge of the parent-side PD session this session wraps.
    #[must_use]
    pub fn parent_pd(&self) -> Badge {
        self.parent_pd
    }

    /// The PD's address-space region map.
    #[must_use]
    pub fn address_space(&self) -> Arc<RegionMapShadow> {
        Arc::clone(&self.address_space)
    }

    /// The PD's stack-area region map.
    #[must_use]
    pub fn stack_area(&self) -> Arc<RegionMapShadow> {
        Arc::clone(&self.stack_area)
    }

    /// The PD's linker-area region map.
    #[must_use]
    pub fn linker_area(&self) -> Arc<RegionMapShadow> {
        Arc::clone(&self.linker_area)
    }

    /// Allocate a signal source, shadowing the returned badge.
    pub fn alloc_signal_source(&self) -> Result<Badge, EngineError> {
        let badge = self.pd.alloc_signal_source(self.parent_pd)?;
        self.signal_sources
            .lock()
            .expect("signal sources lock")
            .push(SignalSourceRecord {
                badge,
                bootstrapped: self.child.bootstrapped(),
            });
        Ok(badge)
    }

    /// Free a signal source: forward, then enqueue the record for
    /// destruction at the next checkpoint.
    pub fn free_signal_source(&self, badge: Badge) -> Result<(), EngineError> {
        let sources = self.signal_sources.lock().expect("signal sources lock");
        if !sources.iter().any(|record| record.badge == badge) {
            return Err(EngineError::UnknownBadge(badge));
        }
        self.pd.free_signal_source(self.parent_pd, badge)?;
        self.destroyed_sources
            .lock()
            .expect("destroyed sources lock")
            .push_back(badge);
        Ok(())
    }

    /// Allocate a signal context bound to `source`, shadowing the badge
    /// together with the `(source, imprint)` pair.
    pub fn alloc_context(&self, source: Badge, imprint: u64) -> Result<Badge, EngineError> {
        let badge = self.pd.alloc_context(self.parent_pd, source, imprint)?;
        self.signal_contexts
            .lock()
            .expect("signal contexts lock")
            .push(SignalContextRecord {
                badge,
                source_badge: source,
                imprint,
                bootstrapped: self.child.bootstrapped(),
            });
        Ok(badge)
    }

    /// Free a signal context: forward, then enqueue the record.
    pub fn free_context(&self, badge: Badge) -> Result<(), EngineError> {
        let contexts = self.signal_contexts.lock().expect("signal contexts lock");
        if !contexts.iter().any(|record| record.badge == badge) {
            return Err(EngineError::UnknownBadge(badge));
        }
        self.pd.free_context(self.parent_pd, badge)?;
        self.destroyed_contexts
            .lock()
            .expect("destroyed contexts lock")
            .push_back(badge);
        Ok(())
    }

    /// Submit signals to a context; pure forwarding.
    pub fn submit(&self, context: Badge, count: u32) -> Result<(), EngineError> {
        Ok(self.pd.submit(context, count)?)
    }

    /// Allocate a native RPC capability for the entrypoint `ep`.
    pub fn alloc_rpc_cap(&self, ep: Badge) -> Result<Badge, EngineError> {
        let badge = self.pd.alloc_rpc_cap(self.parent_pd, ep)?;
        self.native_caps
            .lock()
            .expect("native caps lock")
            .push(NativeCapRecord {
                badge,
                ep_badge: ep,
                bootstrapped: self.child.bootstrapped(),
            });
        Ok(badge)
    }

    /// Free a native RPC capability. The lookup keys on the endpoint badge,
    /// not the capability badge: the kernel reuses the endpoint badge across
    /// allocations.
    pub fn free_rpc_cap(&self, cap: Badge) -> Result<(), EngineError> {
        let caps = self.native_caps.lock().expect("native caps lock");
        let Some(record) = caps.iter().find(|record| record.ep_badge == cap) else {
            return Err(EngineError::UnknownBadge(cap));
        };
        let badge = record.badge;
        drop(caps);
        self.pd.free_rpc_cap(self.parent_pd, badge)?;
        self.destroyed_native_caps
            .lock()
            .expect("destroyed native caps lock")
            .push_back(badge);
        Ok(())
    }

    /// Assign the parent capability; pure forwarding.
    pub fn assign_parent(&self, parent: Badge) -> Result<(), EngineError> {
        Ok(self.pd.assign_parent(self.parent_pd, parent)?)
    }

    /// Assign a PCI device; pure forwarding.
    pub fn assign_pci(&self, addr: u64, bdf: u16) -> Result<bool, EngineError> {
        Ok(self.pd.assign_pci(self.parent_pd, addr, bdf)?)
    }

    /// Make `account` the reference account; pure forwarding.
    pub fn ref_account(&self, account: Badge) -> Result<(), EngineError> {
        Ok(self.pd.ref_account(self.parent_pd, account)?)
    }

    /// Transfer quota to another PD; pure forwarding.
    pub fn transfer_quota(&self, to: Badge, amount: u64) -> Result<(), EngineError> {
        Ok(self.pd.transfer_quota(self.parent_pd, to, amount)?)
    }

    /// Query the capability quota; pure forwarding.
    pub fn cap_quota(&self) -> Result<u64, EngineError> {
        Ok(self.pd.cap_quota(self.parent_pd)?)
    }

    /// Query the number of used capabilities; pure forwarding.
    pub fn used_caps(&self) -> Result<u64, EngineError> {
        Ok(self.pd.used_caps(self.parent_pd)?)
    }

    /// Query the RAM quota; pure forwarding.
    pub fn ram_quota(&self) -> Result<u64, EngineError> {
        Ok(self.pd.ram_quota(self.parent_pd)?)
    }

    /// Query the amount of used RAM; pure forwarding.
    pub fn used_ram(&self) -> Result<u64, EngineError> {
        Ok(self.pd.used_ram(self.parent_pd)?)
    }

    /// Allocate an anonymous dataspace from the PD quota; pure forwarding.
    /// The dataspace carries no child-observable identity, so no shadow
    /// record is created.
    pub fn alloc(&self, size: u64) -> Result<Badge, EngineError> {
        Ok(self.pd.alloc(self.parent_pd, size)?)
    }

    /// Free a dataspace allocated from the PD quota; pure forwarding.
    pub fn free(&self, ds: Badge) -> Result<(), EngineError> {
        Ok(self.pd.free(self.parent_pd, ds)?)
    }

    /// Query a dataspace size; pure forwarding.
    pub fn dataspace_size(&self, ds: Badge) -> Result<u64, EngineError> {
        Ok(self.pd.dataspace_size(ds)?)
    }

    /// Eagerly map a virtual range; pure forwarding.
    pub fn map(&self, virt: u64, size: u64) -> Result<(), EngineError> {
        Ok(self.pd.map(self.parent_pd, virt, size)?)
    }

    /// Snapshot reference of the live signal-source list.
    pub(crate) fn signal_sources(&self) -> Vec<SignalSourceRecord> {
        self.signal_sources
            .lock()
            .expect("signal sources lock")
            .clone()
    }

    /// Snapshot reference of the live signal-context list.
    pub(crate) fn signal_contexts(&self) -> Vec<SignalContextRecord> {
        self.signal_contexts
            .lock()
            .expect("signal contexts lock")
            .clone()
    }

    /// Snapshot reference of the live native-capability list.
    pub(crate) fn native_caps(&self) -> Vec<NativeCapRecord> {
        self.native_caps.lock().expect("native caps lock").clone()
    }

    /// Number of records currently queued for destruction, across all three
    /// sequences.
    #[must_use]
    pub fn pending_destruction(&self) -> usize {
        self.destroyed_sources
            .lock()
            .expect("destroyed sources lock")
            .len()
            + self
                .destroyed_contexts
                .lock()
                .expect("destroyed contexts lock")
                .len()
            + self
                .destroyed_native_caps
                .lock()
                .expect("destroyed native caps lock")
                .len()
    }

    /// Drain all three destruction FIFOs, removing reclaimed records from
    /// their live lists. Runs only inside `checkpoint()`.
    pub(crate) fn drain_destroyed(&self) {
        drain_records(&self.destroyed_sources, &self.signal_sources, |r| r.badge);
        drain_records(&self.destroyed_contexts, &self.signal_contexts, |r| r.badge);
        drain_records(&self.destroyed_native_caps, &self.native_caps, |r| r.badge);
    }
}

fn drain_records<T>(
    fifo: &Mutex<VecDeque<Badge>>,
    live: &Mutex<Vec<T>>,
    badge_of: impl Fn(&T) -> Badge,
) {
    let drained: Vec<Badge> = {
        let mut fifo = fifo.lock().expect("destruction fifo lock");
        mem::take(&mut *fifo).into()
    };
    if drained.is_empty() {
        return;
    }
    let mut live = live.lock().expect("live record lock");
    live.retain(|record| !drained.contains(&badge_of(record)));
}

/// Factory root for interposed PD sessions.
pub struct PdRoot {
    parent: Parent,
    registry: Arc<ChildRegistry>,
    sessions: Mutex<Vec<Arc<PdSession>>>,
    destroyed: Mutex<VecDeque<Badge>>,
}

impl PdRoot {
    pub(crate) fn new(parent: Parent, registry: Arc<ChildRegistry>) -> Self {
        Self {
            parent,
            registry,
            sessions: Mutex::new(Vec::new()),
            destroyed: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a PD session from the child's creation-argument string. The
    /// parent sees the quota readjusted by the shadow bookkeeping overhead;
    /// the child's original string is preserved on the record.
    pub fn create_session(&self, creation_args: &str) -> Result<Arc<PdSession>, EngineError> {
        let label = args::string_value(creation_args, "label")
            .unwrap_or_default()
            .to_owned();
        let adjusted = readjusted_args(creation_args, mem::size_of::<PdSession>() as u64);
        let child = self.registry.find_or_create(&label);
        let handle = self
            .parent
            .pd
            .create_session(&label, &adjusted)
            .map_err(|err| EngineError::refused(ServiceKind::Pd, err))?;
        debug!(
            "new pd session {} for child {label}, address space ds {}",
            handle.session, handle.address_space.ds_badge
        );
        let bootstrapped = child.bootstrapped();
        let session = Arc::new(PdSession {
            meta: SessionMeta::new(handle.session, creation_args, bootstrapped),
            child: Arc::clone(&child),
            pd: Arc::clone(&self.parent.pd),
            parent_pd: handle.session,
            address_space: Arc::new(RegionMapShadow::new(
                handle.address_space,
                bootstrapped,
                Arc::clone(&self.parent.rm),
            )),
            stack_area: Arc::new(RegionMapShadow::new(
                handle.stack_area,
                bootstrapped,
                Arc::clone(&self.parent.rm),
            )),
            linker_area: Arc::new(RegionMapShadow::new(
                handle.linker_area,
                bootstrapped,
                Arc::clone(&self.parent.rm),
            )),
            signal_sources: Mutex::new(Vec::new()),
            destroyed_sources: Mutex::new(VecDeque::new()),
            signal_contexts: Mutex::new(Vec::new()),
            destroyed_contexts: Mutex::new(VecDeque::new()),
            native_caps: Mutex::new(Vec::new()),
            destroyed_native_caps: Mutex::new(VecDeque::new()),
        });
        self.sessions
            .lock()
            .expect("pd sessions lock")
            .push(Arc::clone(&session));
        child.sessions.lock().expect("session slots lock").pd = Some(Arc::clone(&session));
        child.note_pd_attached();
        Ok(session)
    }

    /// Upgrade a session: account the parsed quota and forward the original
    /// upgrade string verbatim.
    pub fn upgrade(&self, badge: Badge, upgrade_args: &str) -> Result<(), EngineError> {
        let session = self
            .find_by_badge(badge)
            .ok_or(EngineError::UnknownBadge(badge))?;
        self.parent
            .pd
            .upgrade(badge, upgrade_args)
            .map_err(|err| EngineError::refused(ServiceKind::Pd, err))?;
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

    /// Look up a session by its capability badge. The CPU root uses this to
    /// translate the child-visible PD badge into the parent's PD session.
    #[must_use]
    pub fn find_by_badge(&self, badge: Badge) -> Option<Arc<PdSession>> {
        self.sessions
            .lock()
            .expect("pd sessions lock")
            .iter()
            .find(|session| session.meta.badge() == badge)
            .cloned()
    }

    /// Snapshot reference of the live session list.
    pub(crate) fn sessions(&self) -> Vec<Arc<PdSession>> {
        self.sessions.lock().expect("pd sessions lock").clone()
    }

    /// Drain destroyed sessions and each session's destruction FIFOs. Runs
    /// only inside `checkpoint()`.
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
        let mut sessions = self.sessions.lock().expect("pd sessions lock");
        sessions.retain(|session| {
            if !drained.contains(&session.meta.badge()) {
                return true;
            }
            if let Err(err) = self.parent.pd.close(session.meta.badge()) {
                warn!("parent pd close failed for {}: {err}", session.meta.badge());
            }
            session.child.sessions.lock().expect("session slots lock").pd = None;
            false
        });
    }
}
