//! Runtime configuration: the enable/enforce toggles and developer origin.
//!
//! Two packed bit sets drive the engine. *Enable* bits decide which checks
//! run at all; *enforce* bits decide whether a failing check denies the
//! operation or merely logs and notifies (permissive mode). Both surfaces
//! read and write as hex masks; `devorig` is a signed decimal.
//!
//! Mutation takes the global write lock. Reads are deliberately
//! unsynchronized relaxed loads: toggles are set once at boot or flipped by
//! a single administrator, and a torn intermediate observation is harmless.
//!
//! Two latches are monotonic: `seal` (once set, the enable/enforce surfaces
//! refuse further writes — enforced by the control layer) and
//! `hashlist_ready` (set once the bootstrap helper has populated the root
//! hashlist; tightens control-surface access).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

use bitflags::bitflags;

bitflags! {
    /// Which subsystems are switched on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnableFlags: u32 {
        /// Master switch for integrity checking.
        const HASH_CHECK   = 1 << 0;
        /// Source-origin checking.
        const SOURCE_ID    = 1 << 1;
        /// Data-file-open checking inside protected directories.
        const DATA_OPEN    = 1 << 2;
        /// File attribute (uid/gid/mode) checking.
        const ATTRIB       = 1 << 3;
        /// Invoke the userspace helper when an entry is missing.
        const TRY_LOAD     = 1 << 4;
        /// Only enforce files present in the reference hashlist.
        const LISTED_ONLY  = 1 << 5;
        /// Require the "tcb" resource token for control-surface writes.
        const SEAL_TCB     = 1 << 6;
        /// Freeze the enable/enforce surfaces.
        const SEAL         = 1 << 7;
        /// Check kernel modules against the whitelist.
        const MODULE_CHECK = 1 << 8;
    }
}

bitflags! {
    /// Which failing checks actually deny the operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnforceFlags: u32 {
        const HASH_CHECK = 1 << 0;
        const SOURCE_ID  = 1 << 1;
        const DATA_OPEN  = 1 << 2;
        const ATTRIB     = 1 << 3;
    }
}

/// Largest accepted enable mask.
pub const ENABLE_ALL: u32 = 0x1ff;

/// Largest accepted enforce mask.
pub const ENFORCE_ALL: u32 = 0xf;

/// Engine configuration state.
pub struct Config {
    enable: AtomicU32,
    enforce: AtomicU32,
    devorig: AtomicI64,
    hashlist_ready: AtomicBool,
    write_lock: Mutex<()>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(EnableFlags::HASH_CHECK, EnforceFlags::empty())
    }
}

impl Config {
    pub fn new(enable: EnableFlags, enforce: EnforceFlags) -> Self {
        Self {
            enable: AtomicU32::new(enable.bits()),
            enforce: AtomicU32::new(enforce.bits()),
            devorig: AtomicI64::new(0),
            hashlist_ready: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    pub fn enable(&self) -> EnableFlags {
        EnableFlags::from_bits_truncate(self.enable.load(Ordering::Relaxed))
    }

    pub fn enforce(&self) -> EnforceFlags {
        EnforceFlags::from_bits_truncate(self.enforce.load(Ordering::Relaxed))
    }

    pub fn set_enable(&self, flags: EnableFlags) {
        let _guard = self.write_lock.lock().expect("config lock poisoned");
        self.enable.store(flags.bits(), Ordering::Relaxed);
    }

    pub fn set_enforce(&self, flags: EnforceFlags) {
        let _guard = self.write_lock.lock().expect("config lock poisoned");
        self.enforce.store(flags.bits(), Ordering::Relaxed);
    }

    // Shorthand accessors for the hot paths.

    pub fn engine_enabled(&self) -> bool {
        self.enable().contains(EnableFlags::HASH_CHECK)
    }

    pub fn source_check_enabled(&self) -> bool {
        self.enable().contains(EnableFlags::SOURCE_ID)
    }

    pub fn data_check_enabled(&self) -> bool {
        self.enable().contains(EnableFlags::DATA_OPEN)
    }

    pub fn attrib_check_enabled(&self) -> bool {
        self.enable().contains(EnableFlags::ATTRIB)
    }

    pub fn try_load_enabled(&self) -> bool {
        self.enable().contains(EnableFlags::TRY_LOAD)
    }

    pub fn listed_only(&self) -> bool {
        self.enable().contains(EnableFlags::LISTED_ONLY)
    }

    pub fn seal_requires_tcb(&self) -> bool {
        self.enable().contains(EnableFlags::SEAL_TCB)
    }

    pub fn sealed(&self) -> bool {
        self.enable().contains(EnableFlags::SEAL)
    }

    pub fn module_check_enabled(&self) -> bool {
        self.enable().contains(EnableFlags::MODULE_CHECK)
    }

    /// Disable the whole engine (bootstrap failure on a development
    /// device).
    pub fn disable_engine(&self) {
        let _guard = self.write_lock.lock().expect("config lock poisoned");
        let current = EnableFlags::from_bits_truncate(self.enable.load(Ordering::Relaxed));
        self.enable
            .store((current - EnableFlags::HASH_CHECK).bits(), Ordering::Relaxed);
    }

    /// Has the bootstrap helper populated the root hashlist?
    pub fn hashlist_ready(&self) -> bool {
        self.hashlist_ready.load(Ordering::Relaxed)
    }

    /// Latch root-hashlist readiness. Never cleared.
    pub fn set_hashlist_ready(&self) {
        self.hashlist_ready.store(true, Ordering::Relaxed);
    }

    /// Developer-origin source identifier used for unlisted objects in
    /// listed-only mode. `0` means "not yet defined".
    pub fn devorig(&self) -> i64 {
        self.devorig.load(Ordering::Relaxed)
    }

    pub fn set_devorig(&self, value: i64) {
        let _guard = self.write_lock.lock().expect("config lock poisoned");
        self.devorig.store(value, Ordering::Relaxed);
    }

    // ── Text surface ─────────────────────────────────────────────────────────

    /// `enabled` entry read format.
    pub fn format_enable(&self) -> String {
        format!("{:#x}\n", self.enable().bits())
    }

    /// `enforce` entry read format.
    pub fn format_enforce(&self) -> String {
        format!("{:#x}\n", self.enforce().bits())
    }

    /// `devorig` entry read format.
    pub fn format_devorig(&self) -> String {
        format!("{}\n", self.devorig())
    }

    /// Parse and store an `enabled` write. Input is a hex mask with an
    /// optional `0x` prefix; values above [`ENABLE_ALL`] are rejected.
    pub fn parse_enable(&self, input: &str) -> Result<(), String> {
        let value = parse_hex(input)?;
        if value > ENABLE_ALL {
            return Err(format!("enable mask out of range: {input:?}"));
        }
        self.set_enable(EnableFlags::from_bits_truncate(value));
        Ok(())
    }

    /// Parse and store an `enforce` write.
    pub fn parse_enforce(&self, input: &str) -> Result<(), String> {
        let value = parse_hex(input)?;
        if value > ENFORCE_ALL {
            return Err(format!("enforce mask out of range: {input:?}"));
        }
        self.set_enforce(EnforceFlags::from_bits_truncate(value));
        Ok(())
    }

    /// Parse and store a `devorig` write (signed decimal).
    pub fn parse_devorig(&self, input: &str) -> Result<(), String> {
        let value: i64 = input
            .trim()
            .parse()
            .map_err(|_| format!("bad devorig input: {input:?}"))?;
        self.set_devorig(value);
        Ok(())
    }
}

fn parse_hex(input: &str) -> Result<u32, String> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u32::from_str_radix(digits, 16).map_err(|_| format!("bad hex input: {input:?}"))
}
