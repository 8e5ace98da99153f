// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Define the backend seam between the engine and the real parent environment.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Backend traits through which the engine reaches the real parent
//! environment. Every request a monitored child issues against an
//! impersonated service is forwarded through one of these traits before any
//! shadow bookkeeping happens; a parent failure therefore never leaves a
//! stale shadow record behind.

use std::sync::Arc;

use amber_wire::{AffinityLocation, Badge, Kcap, ThreadRegisters};
use thiserror::Error;

/// Errors surfaced by the real parent environment.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParentError {
    /// The parent refused the request outright.
    #[error("parent refused request: {0}")]
    Refused(String),
    /// The parent does not know the referenced resource.
    #[error("parent has no resource for {0}")]
    UnknownHandle(Badge),
    /// The parent could not satisfy the requested quota.
    #[error("parent quota exhausted")]
    QuotaExhausted,
}

/// Handles of the region map triple a parent PD session hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionMapHandle {
    /// Badge of the region-map capability.
    pub badge: Badge,
    /// Badge of the dataspace backing the region map.
    pub ds_badge: Badge,
}

/// Handles returned by a parent PD session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdHandle {
    /// Badge of the PD session capability.
    pub session: Badge,
    /// Address-space region map owned by the PD.
    pub address_space: RegionMapHandle,
    /// Stack-area region map owned by the PD.
    pub stack_area: RegionMapHandle,
    /// Linker-area region map owned by the PD.
    pub linker_area: RegionMapHandle,
}

/// Fault state reported by a region map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultState {
    /// Whether the region map currently reports an unresolved fault.
    pub faulted: bool,
    /// Faulting address, valid while `faulted` is set.
    pub addr: u64,
    /// Whether the faulting access was a write.
    pub write: bool,
}

/// Parent protection-domain service.
pub trait PdBackend: Send + Sync {
    /// Open a PD session for the labelled child.
    fn create_session(&self, label: &str, args: &str) -> Result<PdHandle, ParentError>;
    /// Upgrade the session quota; the argument string travels verbatim.
    fn upgrade(&self, session: Badge, args: &str) -> Result<(), ParentError>;
    /// Close the session and release its parent-side resources.
    fn close(&self, session: Badge) -> Result<(), ParentError>;

    /// Allocate a signal source.
    fn alloc_signal_source(&self, session: Badge) -> Result<Badge, ParentError>;
    /// Free a previously allocated signal source.
    fn free_signal_source(&self, session: Badge, source: Badge) -> Result<(), ParentError>;
    /// Allocate a signal context bound to `source` with the given imprint.
    fn alloc_context(
        &self,
        session: Badge,
        source: Badge,
        imprint: u64,
    ) -> Result<Badge, ParentError>;
    /// Free a previously allocated signal context.
    fn free_context(&self, session: Badge, context: Badge) -> Result<(), ParentError>;
    /// Submit `count` signals to a context.
    fn submit(&self, context: Badge, count: u32) -> Result<(), ParentError>;
    /// Allocate a native RPC capability for the entrypoint `ep`.
    fn alloc_rpc_cap(&self, session: Badge, ep: Badge) -> Result<Badge, ParentError>;
    /// Free a previously allocated native RPC capability.
    fn free_rpc_cap(&self, session: Badge, cap: Badge) -> Result<(), ParentError>;

    /// Make `account` the reference account of the session.
    fn ref_account(&self, session: Badge, account: Badge) -> Result<(), ParentError>;
    /// Transfer quota to another PD session.
    fn transfer_quota(&self, session: Badge, to: Badge, amount: u64) -> Result<(), ParentError>;
    /// Query the capability quota.
    fn cap_quota(&self, session: Badge) -> Result<u64, ParentError>;
    /// Query the number of used capabilities.
    fn used_caps(&self, session: Badge) -> Result<u64, ParentError>;
    /// Query the RAM quota.
    fn ram_quota(&self, session: Badge) -> Result<u64, ParentError>;
    /// Query the amount of used RAM.
    fn used_ram(&self, session: Badge) -> Result<u64, ParentError>;
    /// Allocate an anonymous dataspace from the session quota.
    fn alloc(&self, session: Badge, size: u64) -> Result<Badge, ParentError>;
    /// Free a dataspace allocated from the session quota.
    fn free(&self, session: Badge, ds: Badge) -> Result<(), ParentError>;
    /// Query the size of a dataspace.
    fn dataspace_size(&self, ds: Badge) -> Result<u64, ParentError>;
    /// Eagerly map a virtual range of the PD.
    fn map(&self, session: Badge, virt: u64, size: u64) -> Result<(), ParentError>;
    /// Assign the parent capability of the PD.
    fn assign_parent(&self, session: Badge, parent: Badge) -> Result<(), ParentError>;
    /// Assign a PCI device to the PD.
    fn assign_pci(&self, session: Badge, addr: u64, bdf: u16) -> Result<bool, ParentError>;
}

/// Parent CPU service.
pub trait CpuBackend: Send + Sync {
    /// Open a CPU session for the labelled child.
    fn create_session(&self, label: &str, args: &str) -> Result<Badge, ParentError>;
    /// Upgrade the session quota; the argument string travels verbatim.
    fn upgrade(&self, session: Badge, args: &str) -> Result<(), ParentError>;
    /// Close the session and release its parent-side resources.
    fn close(&self, session: Badge) -> Result<(), ParentError>;

    /// Create a thread inside the parent PD referenced by `pd`.
    #[allow(clippy::too_many_arguments)]
    fn create_thread(
        &self,
        session: Badge,
        pd: Badge,
        name: &str,
        affinity: AffinityLocation,
        weight: u64,
        utcb: u64,
    ) -> Result<Badge, ParentError>;
    /// Create a fixed-priority EDF thread (real-time extension).
    #[allow(clippy::too_many_arguments)]
    fn create_fp_edf_thread(
        &self,
        session: Badge,
        pd: Badge,
        name: &str,
        affinity: AffinityLocation,
        weight: u64,
        utcb: u64,
        priority: u32,
        deadline: u32,
    ) -> Result<Badge, ParentError>;
    /// Destroy a thread.
    fn kill_thread(&self, thread: Badge) -> Result<(), ParentError>;
    /// Start a thread at the given instruction and stack pointers.
    fn start_thread(&self, thread: Badge, ip: u64, sp: u64) -> Result<(), ParentError>;
    /// Pause a thread.
    fn pause_thread(&self, thread: Badge) -> Result<(), ParentError>;
    /// Resume a paused thread.
    fn resume_thread(&self, thread: Badge) -> Result<(), ParentError>;
    /// Enable or disable single-stepping.
    fn single_step(&self, thread: Badge, enabled: bool) -> Result<(), ParentError>;
    /// Retrieve the register state of a paused thread.
    fn thread_state(&self, thread: Badge) -> Result<ThreadRegisters, ParentError>;

    /// Select the scheduling type of a core (real-time extension).
    fn set_sched_type(&self, core: u32, sched_type: u32) -> Result<i32, ParentError>;
    /// Query the scheduling type of a core (real-time extension).
    fn get_sched_type(&self, core: u32) -> Result<i32, ParentError>;
    /// Deploy a scheduling queue dataspace (real-time extension).
    fn deploy_queue(&self, ds: Badge) -> Result<(), ParentError>;
    /// Install a run-queue dataspace (real-time extension).
    fn rq(&self, ds: Badge) -> Result<(), ParentError>;
    /// Install a dead-thread notification dataspace (real-time extension).
    fn dead(&self, ds: Badge) -> Result<(), ParentError>;
    /// Notify the scheduler that the caller was killed (real-time extension).
    fn killed(&self) -> Result<(), ParentError>;
}

/// Parent RAM service plus the byte-level access the orchestrator needs for
/// content copying.
pub trait RamBackend: Send + Sync {
    /// Open a RAM session for the labelled child.
    fn create_session(&self, label: &str, args: &str) -> Result<Badge, ParentError>;
    /// Upgrade the session quota; the argument string travels verbatim.
    fn upgrade(&self, session: Badge, args: &str) -> Result<(), ParentError>;
    /// Close the session and release its parent-side resources.
    fn close(&self, session: Badge) -> Result<(), ParentError>;

    /// Allocate a dataspace. `session` may be [`Badge::HOST`] for
    /// engine-internal allocations such as content-backing dataspaces.
    fn alloc(&self, session: Badge, size: u64, cached: bool) -> Result<Badge, ParentError>;
    /// Free a dataspace.
    fn free(&self, session: Badge, ds: Badge) -> Result<(), ParentError>;
    /// Query the size of a dataspace.
    fn size(&self, ds: Badge) -> Result<u64, ParentError>;
    /// Read bytes out of a dataspace.
    fn read(&self, ds: Badge, offset: u64, buf: &mut [u8]) -> Result<(), ParentError>;
    /// Write bytes into a dataspace.
    fn write(&self, ds: Badge, offset: u64, bytes: &[u8]) -> Result<(), ParentError>;
    /// Copy a byte range between dataspaces. Collapses the original
    /// attach/memcpy/detach sequence into a single parent round trip.
    fn copy(
        &self,
        src: Badge,
        src_offset: u64,
        dst: Badge,
        dst_offset: u64,
        len: u64,
    ) -> Result<(), ParentError>;
}

/// Parent RM service.
pub trait RmBackend: Send + Sync {
    /// Open an RM session for the labelled child.
    fn create_session(&self, label: &str, args: &str) -> Result<Badge, ParentError>;
    /// Upgrade the session quota; the argument string travels verbatim.
    fn upgrade(&self, session: Badge, args: &str) -> Result<(), ParentError>;
    /// Close the session and release its parent-side resources.
    fn close(&self, session: Badge) -> Result<(), ParentError>;

    /// Create a region map of the given size.
    fn create_region_map(&self, session: Badge, size: u64) -> Result<RegionMapHandle, ParentError>;
    /// Destroy a region map created through `create_region_map`.
    fn destroy_region_map(&self, rm: Badge) -> Result<(), ParentError>;
    /// Attach a dataspace window into a region map, returning the relative
    /// address the parent selected (or honoured, with `use_local_addr`).
    #[allow(clippy::too_many_arguments)]
    fn attach(
        &self,
        rm: Badge,
        ds: Badge,
        size: u64,
        offset: u64,
        local_addr: u64,
        executable: bool,
        use_local_addr: bool,
    ) -> Result<u64, ParentError>;
    /// Detach the region at the given relative address.
    fn detach(&self, rm: Badge, rel_addr: u64) -> Result<(), ParentError>;
    /// Install a fault handler on the region map.
    fn fault_handler(&self, rm: Badge, sigh: Badge) -> Result<(), ParentError>;
    /// Query the fault state of the region map.
    fn state(&self, rm: Badge) -> Result<FaultState, ParentError>;
}

/// Session kinds with no shadow state beyond their creation arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassiveKind {
    /// LOG service.
    Log,
    /// ROM service.
    Rom,
    /// Timer service.
    Timer,
}

/// Parent LOG/ROM/Timer services.
pub trait PassiveBackend: Send + Sync {
    /// Open a passive session for the labelled child.
    fn create_session(
        &self,
        kind: PassiveKind,
        label: &str,
        args: &str,
    ) -> Result<Badge, ParentError>;
    /// Upgrade the session quota; the argument string travels verbatim.
    fn upgrade(&self, session: Badge, args: &str) -> Result<(), ParentError>;
    /// Close the session.
    fn close(&self, session: Badge) -> Result<(), ParentError>;
    /// Dataspace holding a ROM session's module image.
    fn rom_dataspace(&self, session: Badge) -> Result<(Badge, u64), ParentError>;
}

/// Access to a child's capability table, read from its inspectable
/// dataspace at checkpoint time.
pub trait CapTableBackend: Send + Sync {
    /// Read the `(badge, kcap)` entries of the labelled child.
    fn read_cap_table(&self, label: &str) -> Result<Vec<(Badge, Kcap)>, ParentError>;
}

/// Bundle of backend handles describing one parent environment.
#[derive(Clone)]
pub struct Parent {
    /// Protection-domain service.
    pub pd: Arc<dyn PdBackend>,
    /// CPU service.
    pub cpu: Arc<dyn CpuBackend>,
    /// RAM service.
    pub ram: Arc<dyn RamBackend>,
    /// RM service.
    pub rm: Arc<dyn RmBackend>,
    /// LOG/ROM/Timer services.
    pub passive: Arc<dyn PassiveBackend>,
    /// Capability-table access.
    pub cap_table: Arc<dyn CapTableBackend>,
}

impl std::fmt::Debug for Parent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parent").finish_non_exhaustive()
    }
}
