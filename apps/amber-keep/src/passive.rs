// Author: Lukas Bower
// Purpose: Interposed LOG, ROM, and Timer sessions recording creation args only.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex};

use amber_wire::Badge;
use log::warn;

use crate::child::{ChildRecord, ChildRegistry};
use crate::parent::{Parent, PassiveBackend, PassiveKind};
use crate::session::{readjusted_args, SessionMeta};
use crate::{args, EngineError, ServiceKind};

/// Interposed session of a passive kind. Every operation is forwarded
/// verbatim; the shadow captures only the creation arguments, label, and
/// badge.
pub struct PassiveSession {
    meta: SessionMeta,
    kind: PassiveKind,
    child: Arc<ChildRecord>,
    backend: Arc<dyn PassiveBackend>,
}

impl PassiveSession {
    /// Common session fields.
    #[must_use]
    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    /// Which passive service this session impersonates.
    #[must_use]
    pub fn kind(&self) -> PassiveKind {
        self.kind
    }

    /// Label of the owning child.
    #[must_use]
    pub fn child_label(&self) -> String {
        self.child.label().to_owned()
    }

    /// Dataspace of the ROM module image; only meaningful for ROM sessions.
    pub(crate) fn rom_dataspace(&self) -> Result<(Badge, u64), EngineError> {
        Ok(self.backend.rom_dataspace(self.meta.badge())?)
    }
}

/// Factory root for one passive session kind.
pub struct PassiveRoot {
    parent: Parent,
    registry: Arc<ChildRegistry>,
    kind: PassiveKind,
    sessions: Mutex<Vec<Arc<PassiveSession>>>,
    destroyed: Mutex<VecDeque<Badge>>,
}

impl PassiveRoot {
    pub(crate) fn new(parent: Parent, registry: Arc<ChildRegistry>, kind: PassiveKind) -> Self {
        Self {
            parent,
            registry,
            kind,
            sessions: Mutex::new(Vec::new()),
            destroyed: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a session from the child's creation-argument string.
    pub fn create_session(&self, creation_args: &str) -> Result<Arc<PassiveSession>, EngineError> {
        let label = args::string_value(creation_args, "label")
            .unwrap_or_default()
            .to_owned();
        let adjusted = readjusted_args(creation_args, mem::size_of::<PassiveSession>() as u64);
        let child = self.registry.find_or_create(&label);
        let badge = self
            .parent
            .passive
            .create_session(self.kind, &label, &adjusted)
            .map_err(|err| EngineError::refused(self.service_kind(), err))?;
        let session = Arc::new(PassiveSession {
            meta: SessionMeta::new(badge, creation_args, child.bootstrapped()),
            kind: self.kind,
            child: Arc::clone(&child),
            backend: Arc::clone(&self.parent.passive),
        });
        self.sessions
            .lock()
            .expect("passive sessions lock")
            .push(Arc::clone(&session));
        let mut slots = child.sessions.lock().expect("session slots lock");
        match self.kind {
            PassiveKind::Log => slots.log = Some(Arc::clone(&session)),
            PassiveKind::Rom => slots.rom = Some(Arc::clone(&session)),
            PassiveKind::Timer => slots.timer = Some(Arc::clone(&session)),
        }
        Ok(session)
    }

    /// Upgrade a session, forwarding the upgrade string verbatim.
    pub fn upgrade(&self, badge: Badge, upgrade_args: &str) -> Result<(), EngineError> {
        let session = self
            .find_by_badge(badge)
            .ok_or(EngineError::UnknownBadge(badge))?;
        self.parent
            .passive
            .upgrade(badge, upgrade_args)
            .map_err(|err| EngineError::refused(self.service_kind(), err))?;
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
    pub fn find_by_badge(&self, badge: Badge) -> Option<Arc<PassiveSession>> {
        self.sessions
            .lock()
            .expect("passive sessions lock")
            .iter()
            .find(|session| session.meta.badge() == badge)
            .cloned()
    }

    /// Drain destroyed sessions. Runs only inside `checkpoint()`.
    pub(crate) fn drain_destroyed(&self) {
        let drained: Vec<Badge> = {
            let mut fifo = self.destroyed.lock().expect("destroyed sessions lock");
            mem::take(&mut *fifo).into()
        };
        if drained.is_empty() {
            return;
        }
        let mut sessions = self.sessions.lock().expect("passive sessions lock");
        sessions.retain(|session| {
            if !drained.contains(&session.meta.badge()) {
                return true;
            }
            if let Err(err) = self.parent.passive.close(session.meta.badge()) {
                warn!(
                    "parent close failed for passive session {}: {err}",
                    session.meta.badge()
                );
            }
            let mut slots = session.child.sessions.lock().expect("session slots lock");
            match session.kind {
                PassiveKind::Log => slots.log = None,
                PassiveKind::Rom => slots.rom = None,
                PassiveKind::Timer => slots.timer = None,
            }
            false
        });
    }

    fn service_kind(&self) -> ServiceKind {
        match self.kind {
            PassiveKind::Log => ServiceKind::Log,
            PassiveKind::Rom => ServiceKind::Rom,
            PassiveKind::Timer => ServiceKind::Timer,
        }
    }
}
