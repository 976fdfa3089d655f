//! Userspace control surface: the six configuration entries.
//!
//! | entry      | access | content                                          |
//! |------------|--------|--------------------------------------------------|
//! | `hashlist` | rw     | write one ingestion record / read the list dump  |
//! | `modlist`  | rw     | write 20 raw digest bytes / read the hex dump    |
//! | `cache`    | r      | read the verification-cache dump                 |
//! | `flush`    | w      | any write clears the cache                       |
//! | `enforce`  | rw     | hex enforce mask                                 |
//! | `enabled`  | rw     | hex enable mask                                  |
//! | `devorig`  | rw     | signed decimal developer origin                  |
//!
//! Access tightens over the engine's lifetime: before the root hashlist is
//! initialized writes are open; afterwards they require the administrative
//! capability; once seal-requires-tcb is set they require the "tcb"
//! resource token instead; and after sealing the `enforce` and `enabled`
//! entries refuse writes outright. Reads are always permitted and
//! idempotent.

use thiserror::Error;

use crate::creds::Invoker;
use crate::engine::Validator;
use crate::hashlist::ParseError;

/// Control-surface failure.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The invoker may not perform this operation.
    #[error("operation not permitted")]
    PermissionDenied,
    /// The written value did not parse or was out of range.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A hashlist record was rejected.
    #[error(transparent)]
    BadRecord(#[from] ParseError),
}

/// One control-surface operation, for the centralized access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    EnforceRead,
    EnforceWrite,
    EnableRead,
    EnableWrite,
    CacheRead,
    FlushWrite,
    HashlistRead,
    HashlistWrite,
    ModlistRead,
    ModlistWrite,
    DevorigRead,
    DevorigWrite,
}

impl Validator {
    /// The post-initialization write ladder: open until the root hashlist
    /// is loaded, then administrative capability, then the "tcb" token
    /// once seal-requires-tcb is on.
    fn restricted_access(&self, invoker: &Invoker) -> Result<(), ControlError> {
        if !self.config.hashlist_ready() {
            return Ok(());
        }
        if self.config.seal_requires_tcb() {
            return if self.creds.has_tcb(invoker) {
                Ok(())
            } else {
                Err(ControlError::PermissionDenied)
            };
        }
        if self.creds.has_admin(invoker) {
            Ok(())
        } else {
            Err(ControlError::PermissionDenied)
        }
    }

    /// Centralized access decision for every control entry.
    pub fn control_access(&self, op: ControlOp, invoker: &Invoker) -> Result<(), ControlError> {
        match op {
            ControlOp::EnforceRead
            | ControlOp::EnableRead
            | ControlOp::CacheRead
            | ControlOp::HashlistRead
            | ControlOp::ModlistRead
            | ControlOp::DevorigRead => Ok(()),
            ControlOp::EnforceWrite | ControlOp::EnableWrite => {
                if self.config.sealed() {
                    return Err(ControlError::PermissionDenied);
                }
                self.restricted_access(invoker)
            }
            ControlOp::FlushWrite
            | ControlOp::HashlistWrite
            | ControlOp::ModlistWrite
            | ControlOp::DevorigWrite => self.restricted_access(invoker),
        }
    }

    // ── hashlist ─────────────────────────────────────────────────────────────

    /// Write one reference record in the ingestion grammar.
    pub fn write_hashlist(&self, invoker: &Invoker, record: &[u8]) -> Result<(), ControlError> {
        self.control_access(ControlOp::HashlistWrite, invoker)?;
        self.volumes.ingest(record, self.creds.as_ref())?;
        Ok(())
    }

    /// Read the human-readable hashlist dump.
    pub fn read_hashlist(&self, invoker: &Invoker) -> Result<String, ControlError> {
        self.control_access(ControlOp::HashlistRead, invoker)?;
        Ok(self.volumes.dump())
    }

    // ── modlist ──────────────────────────────────────────────────────────────

    /// Authorize a module digest (20 raw bytes).
    pub fn write_modlist(&self, invoker: &Invoker, data: &[u8]) -> Result<(), ControlError> {
        self.control_access(ControlOp::ModlistWrite, invoker)?;
        self.modlist
            .authorize_raw(data)
            .map_err(|()| ControlError::InvalidInput("module digest too short".into()))
    }

    /// Read the module whitelist as hex.
    pub fn read_modlist(&self, invoker: &Invoker) -> Result<String, ControlError> {
        self.control_access(ControlOp::ModlistRead, invoker)?;
        Ok(self.modlist.dump())
    }

    // ── cache / flush ────────────────────────────────────────────────────────

    /// Read the verification-cache dump.
    pub fn read_cache(&self, invoker: &Invoker) -> Result<String, ControlError> {
        self.control_access(ControlOp::CacheRead, invoker)?;
        Ok(self.cache.dump())
    }

    /// Any write clears the cache.
    pub fn write_flush(&self, invoker: &Invoker) -> Result<(), ControlError> {
        self.control_access(ControlOp::FlushWrite, invoker)?;
        self.cache.flush();
        Ok(())
    }

    // ── enforce / enabled / devorig ──────────────────────────────────────────

    pub fn read_enforce(&self, invoker: &Invoker) -> Result<String, ControlError> {
        self.control_access(ControlOp::EnforceRead, invoker)?;
        Ok(self.config.format_enforce())
    }

    pub fn write_enforce(&self, invoker: &Invoker, input: &str) -> Result<(), ControlError> {
        self.control_access(ControlOp::EnforceWrite, invoker)?;
        self.config
            .parse_enforce(input)
            .map_err(ControlError::InvalidInput)
    }

    pub fn read_enabled(&self, invoker: &Invoker) -> Result<String, ControlError> {
        self.control_access(ControlOp::EnableRead, invoker)?;
        Ok(self.config.format_enable())
    }

    pub fn write_enabled(&self, invoker: &Invoker, input: &str) -> Result<(), ControlError> {
        self.control_access(ControlOp::EnableWrite, invoker)?;
        self.config
            .parse_enable(input)
            .map_err(ControlError::InvalidInput)
    }

    pub fn read_devorig(&self, invoker: &Invoker) -> Result<String, ControlError> {
        self.control_access(ControlOp::DevorigRead, invoker)?;
        Ok(self.config.format_devorig())
    }

    pub fn write_devorig(&self, invoker: &Invoker, input: &str) -> Result<(), ControlError> {
        self.control_access(ControlOp::DevorigWrite, invoker)?;
        self.config
            .parse_devorig(input)
            .map_err(ControlError::InvalidInput)
    }
}
