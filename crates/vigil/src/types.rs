//! Foundational public types for the vigil library.
//!
//! This module defines the core data structures used throughout the engine:
//! - [`FileId`] / [`FileMeta`] / [`FileKind`] — filesystem object identity and metadata
//! - [`RefEntry`] — one reference hashlist entry (the trusted description of a file)
//! - [`NodeType`] — what kind of object an entry protects
//! - [`WriteCred`] — one credential pair of a write-protection list
//! - [`Reason`] — the verification failure taxonomy
//! - [`Hook`] — which enforcement hook triggered a check
//! - [`Denied`] — the denial status a hook returns to the host

use serde::{Deserialize, Serialize};

/// SHA-1 digest length in bytes. The reference hash format is fixed to SHA-1.
pub const SHA1_LEN: usize = 20;

/// A 20-byte SHA-1 digest.
pub type Sha1Digest = [u8; SHA1_LEN];

/// Marker value meaning "no source identifier". Values `0` and `-1` are never
/// valid source identifiers, so `-1` doubles as the unused-slot flag in the
/// verification cache.
pub const UNUSED_SRC_ID: i64 = -1;

/// Identity of a filesystem object: device identifier plus inode number.
///
/// Inode numbers are only unique within one volume, so every lookup key in
/// the engine carries the device identifier as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    /// Device (volume) identifier.
    pub dev: u64,
    /// Inode number within the volume.
    pub ino: u64,
}

impl FileId {
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }
}

/// Coarse file type, as reported by the host filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
    Other,
}

impl FileKind {
    /// Character and block device nodes are exempt from data-open checks.
    pub fn is_device(self) -> bool {
        matches!(self, FileKind::CharDevice | FileKind::BlockDevice)
    }
}

/// Current metadata of a filesystem object, used for attribute enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub uid: u32,
    pub gid: u32,
    /// Full permission mode bits, compared verbatim against the entry.
    pub mode: u32,
    pub size: u64,
    /// Hard link count; an unlink that drops this to zero removes the entry.
    pub nlink: u32,
    pub kind: FileKind,
}

/// What kind of object a reference entry protects.
///
/// Only executables and static data files carry a meaningful digest; the
/// digest field of the other node types is zero-filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// Directly executable or mmap-for-exec content.
    Executable,
    /// Data file whose content is digest-checked on open.
    StaticData,
    /// Data file inside a protected directory that is exempt from the
    /// digest check (it changes at runtime).
    DynamicData,
    /// Directory whose children are subject to data-open verification.
    ImmutableDir,
    /// Directory with additional modification restrictions. Enforced like
    /// an immutable directory.
    ProtectedDir,
}

impl NodeType {
    /// One-letter code used in the human-readable hashlist dump.
    pub fn dump_code(self) -> char {
        match self {
            NodeType::Executable => 'S',
            NodeType::StaticData => 'T',
            NodeType::DynamicData => 'X',
            NodeType::ImmutableDir => 'D',
            NodeType::ProtectedDir => 'P',
        }
    }

    /// Whether entries of this type carry a meaningful digest.
    pub fn has_digest(self) -> bool {
        matches!(self, NodeType::Executable | NodeType::StaticData)
    }
}

/// One write-credential pair. Holding any single pair of an entry's list is
/// sufficient to modify the protected object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCred {
    pub cred_type: i64,
    pub cred_value: i64,
}

/// A reference hashlist entry: the trusted, pre-computed description of one
/// protected filesystem object.
///
/// `ino` is the key within a volume; the owning volume is implied by which
/// hashlist the entry lives in. `wcreds` is `None` when ordinary DAC alone
/// governs modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefEntry {
    pub ino: u64,
    pub nodetype: NodeType,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    /// Opaque source-origin label, interpreted by the credential service.
    pub src_id: i64,
    /// SHA-1 reference digest; zero-filled unless `nodetype.has_digest()`.
    pub digest: Sha1Digest,
    /// Optional write-credential list (OR semantics).
    pub wcreds: Option<Vec<WriteCred>>,
}

/// Why a verification failed.
///
/// Serialized with an internally-tagged `"type"` discriminator so JSON
/// consumers can switch on `reason.type` without a wrapper object. The
/// numeric codes and console messages are part of the notification format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Reason {
    /// The credential service refused the source-origin load.
    SourceId,
    /// No reference entry exists for the file.
    NoReferenceHash,
    /// Current uid/gid/mode disagree with the reference entry.
    Attribute,
    /// Recomputed content digest differs from the reference digest.
    BadHash,
    /// The reference hashlist could not be loaded for the volume.
    LoadFailed,
    /// Writing the positive result to the verification cache failed.
    CacheFailed,
    /// A signal interrupted the measurement. Not a violation; the caller
    /// may retry.
    Interrupted,
}

impl Reason {
    /// Numeric failure code used in notification records.
    pub fn code(self) -> u32 {
        match self {
            Reason::SourceId => 1,
            Reason::NoReferenceHash => 2,
            Reason::Attribute => 3,
            Reason::BadHash => 4,
            Reason::LoadFailed => 5,
            Reason::CacheFailed => 6,
            Reason::Interrupted => 7,
        }
    }

    /// Console log message for this failure.
    pub fn message(self) -> &'static str {
        match self {
            Reason::SourceId => "source origin check",
            Reason::NoReferenceHash => "no reference hash",
            Reason::Attribute => "attribute check",
            Reason::BadHash => "incorrect hash",
            Reason::LoadFailed => "no reference hashlist",
            Reason::CacheFailed => "internal error",
            Reason::Interrupted => "interrupted syscall",
        }
    }
}

/// Which enforcement hook triggered a measurement. The numeric identifier
/// appears in notification records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hook {
    /// Data file open inside a protected directory.
    DataOpen,
    /// Executable memory mapping.
    Mmap,
    /// Direct program execution.
    Exec,
}

impl Hook {
    pub fn code(self) -> u32 {
        match self {
            Hook::DataOpen => 1,
            Hook::Mmap => 2,
            Hook::Exec => 3,
        }
    }
}

/// 2^64 / phi. Multiplier of the Fibonacci hash used to fold inode numbers
/// into bucket indices.
const GOLDEN_RATIO_64: u64 = 0x61c8_8646_80b5_83eb;

/// Fold a 64-bit key into `bits` bits.
pub(crate) fn hash_long(val: u64, bits: u32) -> usize {
    if bits == 0 {
        0
    } else {
        (val.wrapping_mul(GOLDEN_RATIO_64) >> (64 - bits)) as usize
    }
}

/// Status a gateway hook returns to the host kernel when an operation is
/// not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Denial {
    /// Exec or executable mmap refused ("operation not permitted").
    NotPermitted,
    /// Data open or directory modification refused ("access denied").
    AccessDenied,
    /// Write refused while the object is mmapped for execution
    /// ("text file busy").
    TextBusy,
    /// Measurement was interrupted by signal delivery. Not a violation —
    /// nothing is logged or reported and the host may retry the operation.
    Interrupted,
}
