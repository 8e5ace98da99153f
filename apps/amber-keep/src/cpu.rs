// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Interposed CPU session tracking thread shadows and scheduling state.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex};

use amber_wire::{AffinityLocation, Badge, ThreadRegisters};
use log::{debug, warn};

use crate::child::{ChildRecord, ChildRegistry};
use crate::config::Config;
use crate::parent::{CpuBackend, Parent};
use crate::pd::PdRoot;
use crate::session::{readjusted_args, SessionMeta};
use crate::{args, EngineError, ServiceKind};

/// Shadow of one thread the child created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    /// Badge of the thread capability.
    pub badge: Badge,
    /// Thread name.
    pub name: String,
    /// Scheduling weight.
    pub weight: u64,
    /// Affinity the thread was placed at.
    pub affinity: AffinityLocation,
    /// UTCB address supplied at creation.
    pub utcb: u64,
    /// Whether the thread has been started.
    pub started: bool,
    /// Whether the thread is currently paused.
    pub paused: bool,
    /// Whether single-stepping is enabled.
    pub single_step: bool,
    /// Badge of the thread's exception handler.
    pub sigh: Badge,
    /// Fixed priority (real-time extension); 0 for best-effort threads.
    pub priority: u32,
    /// Deadline (real-time extension); 0 for best-effort threads.
    pub deadline: u32,
    /// Whether the thread was created during the bootstrap phase.
    pub bootstrapped: bool,
}

/// Interposed CPU session. Creates and destroys threads on the parent CPU
/// service and keeps one shadow record per live thread.
pub struct CpuSession {
    meta: SessionMeta,
    child: Arc<ChildRecord>,
    cpu: Arc<dyn CpuBackend>,
    pd_root: Arc<PdRoot>,
    child_affinity: AffinityLocation,
    session_affinity: AffinityLocation,
    sigh: Mutex<Badge>,
    threads: Mutex<Vec<ThreadRecord>>,
    destroyed_threads: Mutex<VecDeque<Badge>>,
}

impl CpuSession {
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

    /// Affinity parameters of the session space.
    #[must_use]
    pub fn affinity(&self) -> AffinityLocation {
        self.session_affinity
    }

    /// Create a thread inside the PD the child referenced by badge. Each
    /// child thread is pinned to its statically configured core; the
    /// affinity the child requests is recorded nowhere and the shadow is
    /// seeded with the configured location instead.
    pub fn create_thread(
        &self,
        pd_badge: Badge,
        name: &str,
        _affinity: AffinityLocation,
        weight: u64,
        utcb: u64,
    ) -> Result<Badge, EngineError> {
        self.spawn_thread(pd_badge, name, weight, utcb, None)
    }

    /// Create a fixed-priority EDF thread (real-time extension).
    #[allow(clippy::too_many_arguments)]
    pub fn create_fp_edf_thread(
        &self,
        pd_badge: Badge,
        name: &str,
        _affinity: AffinityLocation,
        weight: u64,
        utcb: u64,
        priority: u32,
        deadline: u32,
    ) -> Result<Badge, EngineError> {
        self.spawn_thread(pd_badge, name, weight, utcb, Some((priority, deadline)))
    }

    fn spawn_thread(
        &self,
        pd_badge: Badge,
        name: &str,
        weight: u64,
        utcb: u64,
        scheduling: Option<(u32, u32)>,
    ) -> Result<Badge, EngineError> {
        let pd_session = self
            .pd_root
            .find_by_badge(pd_badge)
            .ok_or(EngineError::UnknownPdBadge(pd_badge))?;
        let (priority, deadline) = scheduling.unwrap_or((0, 0));
        let badge = match scheduling {
            None => self.cpu.create_thread(
                self.meta.badge(),
                pd_session.parent_pd(),
                name,
                self.child_affinity,
                weight,
                utcb,
            )?,
            Some((priority, deadline)) => self.cpu.create_fp_edf_thread(
                self.meta.badge(),
                pd_session.parent_pd(),
                name,
                self.child_affinity,
                weight,
                utcb,
                priority,
                deadline,
            )?,
        };
        debug!(
            "child {} created thread \"{name}\" ({badge}) at ({}, {})",
            self.child.label(),
            self.child_affinity.xpos,
            self.child_affinity.ypos
        );
        self.threads
            .lock()
            .expect("threads lock")
            .push(ThreadRecord {
                badge,
                name: name.to_owned(),
                weight,
                affinity: self.child_affinity,
                utcb,
                started: false,
                paused: false,
                single_step: false,
                sigh: Badge::HOST,
                priority,
                deadline,
                bootstrapped: self.child.bootstrapped(),
            });
        Ok(badge)
    }

    /// Destroy a thread: forward, then enqueue the shadow for destruction at
    /// the next checkpoint.
    pub fn kill_thread(&self, badge: Badge) -> Result<(), EngineError> {
        let threads = self.threads.lock().expect("threads lock");
        if !threads.iter().any(|record| record.badge == badge) {
            return Err(EngineError::UnknownBadge(badge));
        }
        self.cpu.kill_thread(badge)?;
        self.destroyed_threads
            .lock()
            .expect("destroyed threads lock")
            .push_back(badge);
        Ok(())
    }

    /// Start a thread at the given instruction and stack pointers.
    pub fn start_thread(&self, badge: Badge, ip: u64, sp: u64) -> Result<(), EngineError> {
        self.with_thread(badge, |record| record.started = true)?;
        Ok(self.cpu.start_thread(badge, ip, sp)?)
    }

    /// Pause one thread on behalf of the child.
    pub fn pause_thread(&self, badge: Badge) -> Result<(), EngineError> {
        self.with_thread(badge, |record| record.paused = true)?;
        Ok(self.cpu.pause_thread(badge)?)
    }

    /// Resume one thread on behalf of the child.
    pub fn resume_thread(&self, badge: Badge) -> Result<(), EngineError> {
        self.with_thread(badge, |record| record.paused = false)?;
        Ok(self.cpu.resume_thread(badge)?)
    }

    /// Enable or disable single-stepping on a thread.
    pub fn single_step(&self, badge: Badge, enabled: bool) -> Result<(), EngineError> {
        self.with_thread(badge, |record| record.single_step = enabled)?;
        Ok(self.cpu.single_step(badge, enabled)?)
    }

    /// Install the session-level exception handler.
    pub fn exception_sigh(&self, sigh: Badge) {
        *self.sigh.lock().expect("sigh lock") = sigh;
    }

    /// Badge of the session-level exception handler.
    #[must_use]
    pub fn sigh(&self) -> Badge {
        *self.sigh.lock().expect("sigh lock")
    }

    /// Select the scheduling type of a core; pure forwarding.
    pub fn set_sched_type(&self, core: u32, sched_type: u32) -> Result<i32, EngineError> {
        Ok(self.cpu.set_sched_type(core, sched_type)?)
    }

    /// Query the scheduling type of a core; pure forwarding.
    pub fn get_sched_type(&self, core: u32) -> Result<i32, EngineError> {
        Ok(self.cpu.get_sched_type(core)?)
    }

    /// Deploy a scheduling queue dataspace; pure forwarding.
    pub fn deploy_queue(&self, ds: Badge) -> Result<(), EngineError> {
        Ok(self.cpu.deploy_queue(ds)?)
    }

    /// Install a run-queue dataspace; pure forwarding.
    pub fn rq(&self, ds: Badge) -> Result<(), EngineError> {
        Ok(self.cpu.rq(ds)?)
    }

    /// Install a dead-thread notification dataspace; pure forwarding.
    pub fn dead(&self, ds: Badge) -> Result<(), EngineError> {
        Ok(self.cpu.dead(ds)?)
    }

    /// Notify the scheduler of a killed caller; pure forwarding.
    pub fn killed(&self) -> Result<(), EngineError> {
        Ok(self.cpu.killed()?)
    }

    /// Pause every thread of this session. Administrative, invoked by the
    /// checkpoint orchestrator. Threads already queued for destruction are
    /// skipped; their kernel object is gone.
    pub(crate) fn pause_all(&self) -> Result<(), EngineError> {
        let doomed = self.doomed_threads();
        for record in self.threads() {
            if doomed.contains(&record.badge) {
                continue;
            }
            self.cpu.pause_thread(record.badge)?;
        }
        Ok(())
    }

    /// Resume every thread of this session. Administrative, invoked by the
    /// checkpoint orchestrator.
    pub(crate) fn resume_all(&self) -> Result<(), EngineError> {
        let doomed = self.doomed_threads();
        for record in self.threads() {
            if doomed.contains(&record.badge) {
                continue;
            }
            self.cpu.resume_thread(record.badge)?;
        }
        Ok(())
    }

    fn doomed_threads(&self) -> Vec<Badge> {
        self.destroyed_threads
            .lock()
            .expect("destroyed threads lock")
            .iter()
            .copied()
            .collect()
    }

    /// Fetch the register state of a paused thread.
    pub(crate) fn thread_state(&self, badge: Badge) -> Result<ThreadRegisters, EngineError> {
        Ok(self.cpu.thread_state(badge)?)
    }

    /// Snapshot reference of the live thread list.
    pub(crate) fn threads(&self) -> Vec<ThreadRecord> {
        self.threads.lock().expect("threads lock").clone()
    }

    /// Number of threads currently queued for destruction.
    #[must_use]
    pub fn pending_destruction(&self) -> usize {
        self.destroyed_threads
            .lock()
            .expect("destroyed threads lock")
            .len()
    }

    fn with_thread(
        &self,
        badge: Badge,
        update: impl FnOnce(&mut ThreadRecord),
    ) -> Result<(), EngineError> {
        let mut threads = self.threads.lock().expect("threads lock");
        let Some(record) = threads.iter_mut().find(|record| record.badge == badge) else {
            return Err(EngineError::UnknownBadge(badge));
        };
        update(record);
        Ok(())
    }

    /// Drain the destruction FIFO, removing reclaimed threads from the live
    /// list. Runs only inside `checkpoint()`.
    pub(crate) fn drain_destroyed(&self) {
        let drained: Vec<Badge> = {
            let mut fifo = self.destroyed_threads.lock().expect("destroyed threads lock");
            mem::take(&mut *fifo).into()
        };
        if drained.is_empty() {
            return;
        }
        let mut threads = self.threads.lock().expect("threads lock");
        threads.retain(|record| !drained.contains(&record.badge));
    }
}

/// Factory root for interposed CPU sessions. Holds the PD root so thread
/// creation can translate child-visible PD badges into parent PD sessions.
pub struct CpuRoot {
    parent: Parent,
    registry: Arc<ChildRegistry>,
    pd_root: Arc<PdRoot>,
    config: Config,
    sessions: Mutex<Vec<Arc<CpuSession>>>,
    destroyed: Mutex<VecDeque<Badge>>,
}

impl CpuRoot {
    pub(crate) fn new(
        parent: Parent,
        registry: Arc<ChildRegistry>,
        pd_root: Arc<PdRoot>,
        config: Config,
    ) -> Self {
        Self {
            parent,
            registry,
            pd_root,
            config,
            sessions: Mutex::new(Vec::new()),
            destroyed: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a CPU session from the child's creation-argument string.
    pub fn create_session(&self, creation_args: &str) -> Result<Arc<CpuSession>, EngineError> {
        let label = args::string_value(creation_args, "label")
            .unwrap_or_default()
            .to_owned();
        let adjusted = readjusted_args(creation_args, mem::size_of::<CpuSession>() as u64);
        let child = self.registry.find_or_create(&label);
        let badge = self
            .parent
            .cpu
            .create_session(&label, &adjusted)
            .map_err(|err| EngineError::refused(ServiceKind::Cpu, err))?;
        let session = Arc::new(CpuSession {
            meta: SessionMeta::new(badge, creation_args, child.bootstrapped()),
            child: Arc::clone(&child),
            cpu: Arc::clone(&self.parent.cpu),
            pd_root: Arc::clone(&self.pd_root),
            child_affinity: self.config.child_affinity(&label),
            session_affinity: self.config.session_affinity(),
            sigh: Mutex::new(Badge::HOST),
            threads: Mutex::new(Vec::new()),
            destroyed_threads: Mutex::new(VecDeque::new()),
        });
        self.sessions
            .lock()
            .expect("cpu sessions lock")
            .push(Arc::clone(&session));
        child.sessions.lock().expect("session slots lock").cpu = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Upgrade a session, forwarding the upgrade string verbatim.
    pub fn upgrade(&self, badge: Badge, upgrade_args: &str) -> Result<(), EngineError> {
        let session = self
            .find_by_badge(badge)
            .ok_or(EngineError::UnknownBadge(badge))?;
        self.parent
            .cpu
            .upgrade(badge, upgrade_args)
            .map_err(|err| EngineError::refused(ServiceKind::Cpu, err))?;
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
    pub fn find_by_badge(&self, badge: Badge) -> Option<Arc<CpuSession>> {
        self.sessions
            .lock()
            .expect("cpu sessions lock")
            .iter()
            .find(|session| session.meta.badge() == badge)
            .cloned()
    }

    /// Snapshot reference of the live session list.
    pub(crate) fn sessions(&self) -> Vec<Arc<CpuSession>> {
        self.sessions.lock().expect("cpu sessions lock").clone()
    }

    /// Pause every thread of every session of this root.
    pub(crate) fn pause_all(&self) -> Result<(), EngineError> {
        for session in self.sessions() {
            session.pause_all()?;
        }
        Ok(())
    }

    /// Resume every thread of every session of this root.
    pub(crate) fn resume_all(&self) -> Result<(), EngineError> {
        for session in self.sessions() {
            session.resume_all()?;
        }
        Ok(())
    }

    /// Drain destroyed sessions and each session's destroyed threads. Runs
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
        let mut sessions = self.sessions.lock().expect("cpu sessions lock");
        sessions.retain(|session| {
            if !drained.contains(&session.meta.badge()) {
                return true;
            }
            if let Err(err) = self.parent.cpu.close(session.meta.badge()) {
                warn!("parent cpu close failed for {}: {err}", session.meta.badge());
            }
            session.child.sessions.lock().expect("session slots lock").cpu = None;
            false
        });
    }
}
