// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Public interface of the Amber checkpoint engine.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Amber is a transparent checkpoint engine for capability-based component
//! trees. It sits between a monitored child and the parent environment by
//! impersonating every privileged service the child consumes (PD, CPU, RAM,
//! RM, LOG, ROM, Timer), records every resource the child allocates, and on
//! demand emits a self-contained snapshot sufficient to reconstruct an
//! equivalent child elsewhere.
//!
//! The hard core is the session-interposition layer (one shadow record per
//! child-held capability, keyed by its stable badge), the checkpoint
//! orchestrator (pause, reconcile, copy, emit), and the serialised snapshot
//! stream defined in `amber-wire`. The kernel, the launcher, and restore
//! logic live behind the seams in [`parent`].

use std::fmt;
use std::sync::{Arc, Mutex};

use amber_wire::Badge;
use thiserror::Error;

pub mod args;
mod checkpoint;
mod child;
pub mod compress;
pub mod config;
mod cpu;
pub mod inproc;
pub mod parent;
mod passive;
mod pd;
mod ram;
mod rm;
mod serialize;
mod session;
mod stored;

pub use child::{ChildRecord, ChildRegistry};
pub use cpu::{CpuRoot, CpuSession, ThreadRecord};
pub use passive::{PassiveRoot, PassiveSession};
pub use pd::{NativeCapRecord, PdRoot, PdSession, SignalContextRecord, SignalSourceRecord};
pub use ram::{DataspaceRecord, DesignatedSub, ManagedDataspace, RamRoot, RamSession};
pub use rm::{AttachedRegion, RegionMapShadow, RmRoot, RmSession};
pub use session::SessionMeta;

use compress::{Compressor, Deflate};
use config::Config;
use parent::{Parent, ParentError, PassiveKind};
use stored::StoredState;

/// The session kinds the engine impersonates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// Protection-domain service.
    Pd,
    /// CPU service.
    Cpu,
    /// RAM service.
    Ram,
    /// RM service.
    Rm,
    /// LOG service.
    Log,
    /// ROM service.
    Rom,
    /// Timer service.
    Timer,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pd => "PD",
            Self::Cpu => "CPU",
            Self::Ram => "RAM",
            Self::Rm => "RM",
            Self::Log => "LOG",
            Self::Rom => "ROM",
            Self::Timer => "Timer",
        };
        write!(f, "{name}")
    }
}

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The child presented a badge no shadow record tracks.
    #[error("no shadow record for {0}")]
    UnknownBadge(Badge),
    /// Thread creation referenced a PD capability outside the PD registry.
    #[error("{0} is not a registered pd session")]
    UnknownPdBadge(Badge),
    /// The real parent service returned an error; no shadow side-effect.
    #[error("parent failure: {0}")]
    Parent(#[from] ParentError),
    /// The readjusted session quota could not be satisfied.
    #[error("adjusted session quota cannot be satisfied")]
    QuotaExceeded,
    /// The real parent refused session creation or upgrade.
    #[error("{kind} session refused: {reason}")]
    SessionRefused {
        /// Kind of the refused session.
        kind: ServiceKind,
        /// Reason reported by the parent.
        reason: String,
    },
    /// The capability-map table lacks an entry for a live shadow badge. The
    /// checkpoint is aborted and threads are resumed.
    #[error("capability map has no entry for shadow {0}")]
    CheckpointConsistency(Badge),
}

impl EngineError {
    /// Map a parent failure during session create/upgrade onto the
    /// child-visible error: quota exhaustion keeps its identity, everything
    /// else surfaces as a refused session.
    pub(crate) fn refused(kind: ServiceKind, err: ParentError) -> Self {
        match err {
            ParentError::QuotaExhausted => Self::QuotaExceeded,
            other => Self::SessionRefused {
                kind,
                reason: other.to_string(),
            },
        }
    }
}

/// A serialised, compressed snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotBlob {
    /// The compressed snapshot stream.
    pub bytes: Vec<u8>,
    /// Length of the compressed stream in bytes.
    pub size: usize,
}

/// The checkpoint engine: session roots, the child registry, and the
/// checkpoint orchestrator, assembled over one parent environment.
///
/// The roots are constructed explicitly here; the host routes the child's
/// session requests to them via [`Engine::resolve_session_request`] or the
/// per-kind accessors.
pub struct Engine {
    parent: Parent,
    registry: Arc<ChildRegistry>,
    pd_root: Arc<PdRoot>,
    cpu_root: Arc<CpuRoot>,
    ram_root: Arc<RamRoot>,
    rm_root: Arc<RmRoot>,
    log_root: Arc<PassiveRoot>,
    timer_root: Arc<PassiveRoot>,
    rom_root: Arc<PassiveRoot>,
    compressor: Box<dyn Compressor>,
    stored: Mutex<StoredState>,
}

impl Engine {
    /// Assemble an engine over the given parent environment and static
    /// configuration, compressing snapshots with DEFLATE.
    #[must_use]
    pub fn new(parent: Parent, config: Config) -> Self {
        Self::with_compressor(parent, config, Box::new(Deflate::default()))
    }

    /// Assemble an engine with an explicit compression oracle.
    #[must_use]
    pub fn with_compressor(
        parent: Parent,
        config: Config,
        compressor: Box<dyn Compressor>,
    ) -> Self {
        let registry = Arc::new(ChildRegistry::new());
        let pd_root = Arc::new(PdRoot::new(parent.clone(), Arc::clone(&registry)));
        let cpu_root = Arc::new(CpuRoot::new(
            parent.clone(),
            Arc::clone(&registry),
            Arc::clone(&pd_root),
            config.clone(),
        ));
        let ram_root = Arc::new(RamRoot::new(
            parent.clone(),
            Arc::clone(&registry),
            config.granularity,
        ));
        let rm_root = Arc::new(RmRoot::new(parent.clone(), Arc::clone(&registry)));
        let log_root = Arc::new(PassiveRoot::new(
            parent.clone(),
            Arc::clone(&registry),
            PassiveKind::Log,
        ));
        let timer_root = Arc::new(PassiveRoot::new(
            parent.clone(),
            Arc::clone(&registry),
            PassiveKind::Timer,
        ));
        let rom_root = Arc::new(PassiveRoot::new(
            parent.clone(),
            Arc::clone(&registry),
            PassiveKind::Rom,
        ));
        Self {
            parent,
            registry,
            pd_root,
            cpu_root,
            ram_root,
            rm_root,
            log_root,
            timer_root,
            rom_root,
            compressor,
            stored: Mutex::new(StoredState::default()),
        }
    }

    /// The child registry.
    #[must_use]
    pub fn registry(&self) -> &ChildRegistry {
        &self.registry
    }

    /// The PD session root.
    #[must_use]
    pub fn pd_root(&self) -> &PdRoot {
        &self.pd_root
    }

    /// The CPU session root.
    #[must_use]
    pub fn cpu_root(&self) -> &CpuRoot {
        &self.cpu_root
    }

    /// The RAM session root.
    #[must_use]
    pub fn ram_root(&self) -> &RamRoot {
        &self.ram_root
    }

    /// The RM session root.
    #[must_use]
    pub fn rm_root(&self) -> &RmRoot {
        &self.rm_root
    }

    /// The LOG session root.
    #[must_use]
    pub fn log_root(&self) -> &PassiveRoot {
        &self.log_root
    }

    /// The Timer session root.
    #[must_use]
    pub fn timer_root(&self) -> &PassiveRoot {
        &self.timer_root
    }

    /// The ROM session root.
    #[must_use]
    pub fn rom_root(&self) -> &PassiveRoot {
        &self.rom_root
    }

    /// Route a session request by service name, the way the parent
    /// environment routes the child's requests to the impersonated services.
    /// Returns `None` for a service the engine does not impersonate.
    pub fn resolve_session_request(
        &self,
        service_name: &str,
        creation_args: &str,
    ) -> Option<Result<Badge, EngineError>> {
        let kind = match service_name {
            "PD" => ServiceKind::Pd,
            "CPU" => ServiceKind::Cpu,
            "RAM" => ServiceKind::Ram,
            "RM" => ServiceKind::Rm,
            "LOG" => ServiceKind::Log,
            "ROM" => ServiceKind::Rom,
            "Timer" => ServiceKind::Timer,
            _ => return None,
        };
        Some(self.create_session(kind, creation_args))
    }

    /// Create a session of the given kind, returning the badge of the
    /// session capability.
    pub fn create_session(
        &self,
        kind: ServiceKind,
        creation_args: &str,
    ) -> Result<Badge, EngineError> {
        match kind {
            ServiceKind::Pd => Ok(self.pd_root.create_session(creation_args)?.meta().badge()),
            ServiceKind::Cpu => Ok(self.cpu_root.create_session(creation_args)?.meta().badge()),
            ServiceKind::Ram => Ok(self.ram_root.create_session(creation_args)?.meta().badge()),
            ServiceKind::Rm => Ok(self.rm_root.create_session(creation_args)?.meta().badge()),
            ServiceKind::Log => Ok(self.log_root.create_session(creation_args)?.meta().badge()),
            ServiceKind::Rom => Ok(self.rom_root.create_session(creation_args)?.meta().badge()),
            ServiceKind::Timer => Ok(self.timer_root.create_session(creation_args)?.meta().badge()),
        }
    }

    /// Mark the end of a child's bootstrap phase. Records created from now
    /// on are no longer part of the initial image.
    pub fn finish_bootstrap(&self, label: &str) {
        match self.registry.find(label) {
            Some(child) => child.finish_bootstrap(),
            None => log::warn!("finish_bootstrap for unknown child {label}"),
        }
    }

    pub(crate) fn parent(&self) -> &Parent {
        &self.parent
    }

    pub(crate) fn compressor(&self) -> &dyn Compressor {
        self.compressor.as_ref()
    }

    pub(crate) fn stored(&self) -> &Mutex<StoredState> {
        &self.stored
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("children", &self.registry.children().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::Identity;
    use crate::inproc::InProcParent;

    fn test_engine() -> (std::sync::Arc<InProcParent>, Engine) {
        let parent = InProcParent::new();
        let engine =
            Engine::with_compressor(parent.parent(), Config::default(), Box::new(Identity));
        (parent, engine)
    }

    #[test]
    fn resolve_routes_known_services_only() {
        let (_parent, engine) = test_engine();
        let badge = engine
            .resolve_session_request("PD", "ram_quota=4096, label=\"hello\"")
            .expect("PD is impersonated")
            .expect("session created");
        assert!(engine.pd_root().find_by_badge(badge).is_some());
        assert!(engine.resolve_session_request("GPU", "label=\"hello\"").is_none());
    }

    #[test]
    fn refused_parent_session_inserts_no_shadow() {
        let (parent, engine) = test_engine();
        parent.set_refuse_sessions(true);
        let err = engine
            .pd_root()
            .create_session("ram_quota=4096, label=\"hello\"")
            .expect_err("parent refusal must surface");
        assert!(matches!(err, EngineError::SessionRefused { kind, .. }
            if kind == ServiceKind::Pd));
        assert!(engine.pd_root().sessions().is_empty());
        parent.set_refuse_sessions(false);
        engine
            .pd_root()
            .create_session("ram_quota=4096, label=\"hello\"")
            .expect("session after re-admission");
    }

    #[test]
    fn session_creation_registers_child_record() {
        let (_parent, engine) = test_engine();
        engine
            .ram_root()
            .create_session("ram_quota=4096, label=\"hello\"")
            .expect("ram session");
        let child = engine.registry().find("hello").expect("child record");
        assert!(child.bootstrapped());
        assert!(!child.destroyed());
    }
}
