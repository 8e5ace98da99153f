// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Track per-child aggregate state and the capability translation map.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use amber_wire::{Badge, Kcap};

use crate::cpu::CpuSession;
use crate::passive::PassiveSession;
use crate::pd::PdSession;
use crate::ram::RamSession;
use crate::rm::RmSession;

/// Session slots of one monitored child, one per session kind.
#[derive(Default)]
pub(crate) struct ChildSessions {
    pub pd: Option<Arc<PdSession>>,
    pub cpu: Option<Arc<CpuSession>>,
    pub ram: Option<Arc<RamSession>>,
    pub rm: Option<Arc<RmSession>>,
    pub log: Option<Arc<PassiveSession>>,
    pub timer: Option<Arc<PassiveSession>>,
    pub rom: Option<Arc<PassiveSession>>,
}

/// Aggregate record of one monitored child.
pub struct ChildRecord {
    label: String,
    bootstrapped: AtomicBool,
    destroyed: AtomicBool,
    pd_attached: AtomicBool,
    pub(crate) sessions: Mutex<ChildSessions>,
    cap_map: Mutex<Vec<(Badge, Kcap)>>,
}

impl ChildRecord {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            bootstrapped: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            pd_attached: AtomicBool::new(false),
            sessions: Mutex::new(ChildSessions::default()),
            cap_map: Mutex::new(Vec::new()),
        }
    }

    /// The child's unique label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the child is still in its bootstrap phase. Records created
    /// while this is set belong to the initial image and need not be
    /// re-created on restore.
    #[must_use]
    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }

    /// Leave the bootstrap phase. Monotonic: once cleared the flag never
    /// reverts.
    pub fn finish_bootstrap(&self) {
        self.bootstrapped.store(false, Ordering::Release);
    }

    /// Whether the child has been destroyed.
    #[must_use]
    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    /// Remember that a PD session was attached at least once. A child whose
    /// PD session is gone again afterwards counts as destroyed.
    pub(crate) fn note_pd_attached(&self) {
        self.pd_attached.store(true, Ordering::Release);
    }

    pub(crate) fn pd_was_attached(&self) -> bool {
        self.pd_attached.load(Ordering::Acquire)
    }

    /// Replace the capability translation map with a freshly built table.
    pub(crate) fn replace_cap_map(&self, table: Vec<(Badge, Kcap)>) {
        *self.cap_map.lock().expect("cap map lock") = table;
    }

    /// Clone the current capability translation map.
    #[must_use]
    pub fn cap_map(&self) -> Vec<(Badge, Kcap)> {
        self.cap_map.lock().expect("cap map lock").clone()
    }

    /// Drop all session slots, breaking the child's reference cycle when the
    /// roots release their side.
    pub(crate) fn clear_sessions(&self) {
        *self.sessions.lock().expect("session slots lock") = ChildSessions::default();
    }
}

/// Registry of all monitored children, keyed by label. The lock is taken
/// only during create and destroy, never on session hot paths.
#[derive(Default)]
pub struct ChildRegistry {
    children: Mutex<Vec<Arc<ChildRecord>>>,
}

impl ChildRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a child by label, creating the record on first use.
    pub fn find_or_create(&self, label: &str) -> Arc<ChildRecord> {
        let mut children = self.children.lock().expect("child registry lock");
        if let Some(child) = children.iter().find(|child| child.label() == label) {
            return Arc::clone(child);
        }
        let child = Arc::new(ChildRecord::new(label));
        children.push(Arc::clone(&child));
        child
    }

    /// Look up a child by label.
    #[must_use]
    pub fn find(&self, label: &str) -> Option<Arc<ChildRecord>> {
        self.children
            .lock()
            .expect("child registry lock")
            .iter()
            .find(|child| child.label() == label)
            .cloned()
    }

    /// All live children in registration order.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<ChildRecord>> {
        self.children.lock().expect("child registry lock").clone()
    }

    /// Remove destroyed children from the registry.
    pub(crate) fn sweep_destroyed(&self) {
        let mut children = self.children.lock().expect("child registry lock");
        children.retain(|child| {
            if child.destroyed() {
                child.clear_sessions();
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_or_create_is_idempotent() {
        let registry = ChildRegistry::new();
        let first = registry.find_or_create("hello");
        let second = registry.find_or_create("hello");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.children().len(), 1);
    }

    #[test]
    fn bootstrap_flag_is_monotonic() {
        let registry = ChildRegistry::new();
        let child = registry.find_or_create("hello");
        assert!(child.bootstrapped());
        child.finish_bootstrap();
        assert!(!child.bootstrapped());
        child.finish_bootstrap();
        assert!(!child.bootstrapped());
    }

    #[test]
    fn destroyed_children_are_swept() {
        let registry = ChildRegistry::new();
        let child = registry.find_or_create("doomed");
        child.mark_destroyed();
        registry.sweep_destroyed();
        assert!(registry.find("doomed").is_none());
    }
}
