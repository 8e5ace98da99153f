// Author: Lukas Bower
// Purpose: Define the snapshot record model shared across Amber components.
#![allow(clippy::module_name_repetitions)]

//! Snapshot data model definitions shared across codec backends.

use core::fmt;

/// Stable 16-bit capability identity assigned by the kernel at creation.
///
/// Badges are the only identity that survives serialisation; raw capability
/// handles never appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Badge(u16);

impl Badge {
    /// Badge reserved for the engine itself when talking to the parent.
    pub const HOST: Badge = Badge(0);

    /// Create a badge from the supplied raw value.
    #[must_use]
    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    /// Access the raw badge value.
    #[must_use]
    pub fn into_raw(self) -> u16 {
        self.0
    }
}

impl From<u16> for Badge {
    fn from(value: u16) -> Self {
        Self::from_raw(value)
    }
}

impl Default for Badge {
    fn default() -> Self {
        Badge::HOST
    }
}

impl fmt::Display for Badge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "badge:{}", self.0)
    }
}

/// Per-child virtual address at which a badge is visible inside the child's
/// capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Kcap(u64);

impl Kcap {
    /// Sentinel for records whose badge the child never observed directly.
    pub const INVALID: Kcap = Kcap(0);

    /// Create a kcap from the supplied raw address.
    #[must_use]
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Access the raw kcap address.
    #[must_use]
    pub fn into_raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for Kcap {
    fn from(value: u64) -> Self {
        Self::from_raw(value)
    }
}

impl Default for Kcap {
    fn default() -> Self {
        Kcap::INVALID
    }
}

/// Possible errors produced while encoding or decoding snapshot streams.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    /// Input buffer was shorter than the declared record length.
    #[error("truncated record")]
    Truncated,
    /// Encountered an unknown record tag.
    #[error("unsupported record tag {0}")]
    Unsupported(u8),
    /// Encountered malformed UTF-8 data.
    #[error("invalid utf8 in string field")]
    InvalidUtf8,
    /// Declared record size does not match the actual payload length.
    #[error("length mismatch: declared {declared} actual {actual}")]
    LengthMismatch {
        /// Record length declared in the frame header.
        declared: u32,
        /// Actual byte length observed in the payload.
        actual: usize,
    },
    /// A boolean field carried a value other than 0 or 1.
    #[error("invalid flag byte {0}")]
    InvalidFlag(u8),
    /// A record referenced an attachment index outside the side table.
    #[error("attachment index {index} out of range ({count} attachments)")]
    AttachmentOutOfRange {
        /// Referenced attachment index.
        index: u32,
        /// Number of attachments present in the stream.
        count: u32,
    },
    /// The stream continued past the final expected record.
    #[error("trailing bytes after snapshot stream")]
    TrailingBytes,
}

/// Index into the snapshot's attachment side table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentRef(u32);

impl AttachmentRef {
    /// Create an attachment reference from a raw index.
    #[must_use]
    pub fn from_raw(index: u32) -> Self {
        Self(index)
    }

    /// Access the raw attachment index.
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// One entry of the attachment side table: the bytes of a copied dataspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Declared byte length; always equals `bytes.len()` in a valid stream.
    pub size: u64,
    /// The copied content.
    pub bytes: Vec<u8>,
}

impl Attachment {
    /// Build an attachment from raw content.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            size: bytes.len() as u64,
            bytes,
        }
    }
}

/// Scheduling affinity of a thread or session within the CPU space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AffinityLocation {
    /// Horizontal position within the affinity space.
    pub xpos: i32,
    /// Vertical position within the affinity space.
    pub ypos: i32,
    /// Width of the occupied area.
    pub width: u32,
    /// Height of the occupied area.
    pub height: u32,
}

impl AffinityLocation {
    /// Construct an affinity location from its four components.
    #[must_use]
    pub fn new(xpos: i32, ypos: i32, width: u32, height: u32) -> Self {
        Self {
            xpos,
            ypos,
            width,
            height,
        }
    }
}

/// Architecture-neutral register snapshot of a paused thread.
///
/// Cross-architecture portability of the block is explicitly out of scope;
/// the layout only promises to round-trip through the wire format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadRegisters {
    /// General-purpose register file.
    pub gpr: [u64; 16],
    /// Instruction pointer.
    pub ip: u64,
    /// Stack pointer.
    pub sp: u64,
}

/// Fields common to every session record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Creation-argument string, bit-preserved from the child's request.
    pub creation_args: String,
    /// Most recent upgrade-argument string, verbatim.
    pub upgrade_args: String,
    /// Badge of the session capability.
    pub badge: Badge,
    /// Child-side capability-table address of the session capability.
    pub kcap: Kcap,
    /// Whether the session was created during the child's bootstrap phase.
    pub bootstrapped: bool,
}

/// One region attached into a region map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachedRegionInfo {
    /// Badge of the attached dataspace.
    pub ds_badge: Badge,
    /// Relative virtual address of the attachment inside the region map.
    pub rel_addr: u64,
    /// Size of the attached window in bytes.
    pub size: u64,
    /// Offset into the attached dataspace.
    pub offset: u64,
    /// Whether the region is mapped executable.
    pub executable: bool,
}

/// A virtual address-space object with its attached regions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionMapInfo {
    /// Badge of the region-map capability.
    pub badge: Badge,
    /// Child-side capability-table address of the region map.
    pub kcap: Kcap,
    /// Badge of the dataspace backing the region map.
    pub ds_badge: Badge,
    /// Badge of the installed fault-handler signal context.
    pub sigh_badge: Badge,
    /// Regions attached into this map, in attach order.
    pub attached: Vec<AttachedRegionInfo>,
}

/// A signal source allocated through the PD session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalSourceInfo {
    /// Badge of the signal-source capability.
    pub badge: Badge,
    /// Child-side capability-table address.
    pub kcap: Kcap,
}

/// A signal context allocated through the PD session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalContextInfo {
    /// Badge of the signal-context capability.
    pub badge: Badge,
    /// Child-side capability-table address.
    pub kcap: Kcap,
    /// Badge of the signal source the context was allocated against.
    pub source_badge: Badge,
    /// Imprint value delivered with every signal.
    pub imprint: u64,
}

/// A native RPC capability allocated through the PD session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeCapInfo {
    /// Badge of the allocated RPC capability.
    pub badge: Badge,
    /// Child-side capability-table address.
    pub kcap: Kcap,
    /// Badge of the entrypoint the capability was allocated for.
    pub ep_badge: Badge,
}

/// Protection-domain session record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PdSessionInfo {
    /// Common session fields.
    pub base: SessionInfo,
    /// The PD's address-space region map.
    pub address_space: RegionMapInfo,
    /// The PD's stack-area region map.
    pub stack_area: RegionMapInfo,
    /// The PD's linker-area region map.
    pub linker_area: RegionMapInfo,
    /// Signal sources alive at checkpoint time, in creation order.
    pub signal_sources: Vec<SignalSourceInfo>,
    /// Signal contexts alive at checkpoint time, in creation order.
    pub signal_contexts: Vec<SignalContextInfo>,
    /// Native RPC capabilities alive at checkpoint time, in creation order.
    pub native_caps: Vec<NativeCapInfo>,
}

/// One thread created through the CPU session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Badge of the thread capability.
    pub badge: Badge,
    /// Child-side capability-table address.
    pub kcap: Kcap,
    /// Thread name.
    pub name: String,
    /// Scheduling weight.
    pub weight: u64,
    /// Affinity location assigned at creation.
    pub affinity: AffinityLocation,
    /// UTCB address supplied at creation.
    pub utcb: u64,
    /// Whether the thread has been started.
    pub started: bool,
    /// Whether the thread is currently paused.
    pub paused: bool,
    /// Whether single-stepping is enabled.
    pub single_step: bool,
    /// Badge of the exception-handler signal context.
    pub sigh_badge: Badge,
    /// Register state captured while the thread was paused.
    pub registers: ThreadRegisters,
    /// Fixed priority for the real-time extension; 0 for best-effort threads.
    pub priority: u32,
    /// Deadline for the real-time extension; 0 for best-effort threads.
    pub deadline: u32,
}

/// CPU session record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuSessionInfo {
    /// Common session fields.
    pub base: SessionInfo,
    /// Badge of the session-level exception handler.
    pub sigh_badge: Badge,
    /// Affinity parameters of the session.
    pub affinity: AffinityLocation,
    /// Threads alive at checkpoint time, in creation order.
    pub threads: Vec<ThreadInfo>,
}

/// One RAM dataspace allocated through the RAM session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataspaceInfo {
    /// Badge of the dataspace capability.
    pub badge: Badge,
    /// Child-side capability-table address.
    pub kcap: Kcap,
    /// Size of the dataspace in bytes.
    pub size: u64,
    /// Whether the dataspace was allocated cached.
    pub cached: bool,
    /// Copied content, when the dataspace participates in content copying.
    pub content: Option<AttachmentRef>,
}

/// RAM session record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RamSessionInfo {
    /// Common session fields.
    pub base: SessionInfo,
    /// Dataspaces alive at checkpoint time, in allocation order.
    pub dataspaces: Vec<DataspaceInfo>,
}

/// RM session record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RmSessionInfo {
    /// Common session fields.
    pub base: SessionInfo,
    /// Region maps created on behalf of the child, in creation order.
    pub region_maps: Vec<RegionMapInfo>,
}

/// Record for a passive session (LOG, ROM, or Timer): creation args only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassiveSessionInfo {
    /// Common session fields.
    pub base: SessionInfo,
}

/// The serialised state of one monitored child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildInfo {
    /// Unique child label.
    pub label: String,
    /// Whether the records below were created during the bootstrap phase.
    pub bootstrapped: bool,
    /// Protection-domain session.
    pub pd: PdSessionInfo,
    /// RAM session.
    pub ram: RamSessionInfo,
    /// CPU session.
    pub cpu: CpuSessionInfo,
    /// RM session, when the child opened one.
    pub rm: Option<RmSessionInfo>,
    /// LOG session, when the child opened one.
    pub log: Option<PassiveSessionInfo>,
    /// Timer session, when the child opened one.
    pub timer: Option<PassiveSessionInfo>,
    /// ROM session, when the child opened one.
    pub rom: Option<PassiveSessionInfo>,
    /// Capability translation map: every badge the child holds with its kcap.
    pub capability_map: Vec<(Badge, Kcap)>,
    /// The child's binary image, when the snapshot includes it.
    pub binary: Option<AttachmentRef>,
}

/// A complete snapshot: the child list plus the attachment side table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// All monitored children in registration order.
    pub children: Vec<ChildInfo>,
    /// Attachment side table referenced by `AttachmentRef` indices.
    pub attachments: Vec<Attachment>,
}

impl Snapshot {
    /// Resolve an attachment reference against the side table.
    #[must_use]
    pub fn attachment(&self, reference: AttachmentRef) -> Option<&Attachment> {
        self.attachments.get(reference.index() as usize)
    }
}
