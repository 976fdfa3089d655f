//! Integrity Protection Policy: the per-event check orchestration.
//!
//! Two public entry points on [`Validator`]:
//! - [`Validator::check_executable`] — exec and executable-mmap events.
//!   Under the per-inode mutex: cache lookup, source-origin check,
//!   hashlist lookup (with the listed-only fallback and the bootstrap
//!   loader on a miss), attribute check, digest recomputation, and the
//!   cache write-back.
//! - [`Validator::check_data_open`] — opens inside protected directories.
//!   Applies only when the parent directory has a reference entry; dynamic
//!   entries skip the digest, directories themselves are always listable.
//!
//! A failing check carries a [`Reason`]. Disposition is split by the
//! enforce bit relevant to the failing check: enforcing denies with the
//! hook-appropriate status, permissive logs, notifies userspace, and
//! admits. Interrupted measurements are neither logged nor reported.

use log::{error, info};

use crate::config::EnforceFlags;
use crate::creds::Invoker;
use crate::digest::{verify_refhash, DigestError};
use crate::engine::{OpenFile, Validator};
use crate::types::{Denial, FileId, FileKind, Hook, Reason, RefEntry};

impl Validator {
    /// Source-origin check. Passes trivially when source checking is not
    /// enabled.
    pub(crate) fn sid_check(&self, name: &str, src_id: i64, invoker: &Invoker) -> bool {
        if !self.config.source_check_enabled() {
            return true;
        }
        let ok = self.creds.may_load(src_id, invoker);
        if !ok {
            info!("source check refused {src_id} for {name}");
        }
        ok
    }

    /// Compare current uid/gid/mode against the reference entry. Passes
    /// trivially when attribute checking is not enabled.
    fn attrib_check(&self, id: FileId, entry: &RefEntry) -> bool {
        if !self.config.attrib_check_enabled() {
            return true;
        }
        match self.fs.metadata(id) {
            Ok(meta) => {
                meta.uid == entry.uid && meta.gid == entry.gid && meta.mode == entry.mode
            }
            Err(_) => false,
        }
    }

    /// Recompute the content digest and compare it to the reference.
    fn hash_check(&self, id: FileId, entry: &RefEntry) -> Result<(), Reason> {
        match verify_refhash(self.fs.as_ref(), id, &entry.digest) {
            Ok(()) => Ok(()),
            Err(DigestError::Interrupted) => Err(Reason::Interrupted),
            Err(DigestError::Mismatch) | Err(DigestError::Io(_)) => Err(Reason::BadHash),
        }
    }

    /// The executable verification sequence. Holds the per-inode mutex so
    /// parallel mappings of the same binary measure it once.
    pub(crate) fn exe_validation(&self, id: FileId, invoker: &Invoker) -> Result<(), Reason> {
        let lock = self.inode_lock(id);
        let _guard = lock.lock().expect("inode measurement mutex poisoned");
        let name = self.fs.name_of(id);

        if let Some(src_id) = self.cache.lookup(id) {
            return if self.sid_check(&name, src_id, invoker) {
                Ok(())
            } else {
                Err(Reason::SourceId)
            };
        }

        let lookup = |ino: u64| self.volumes.get(id.dev).and_then(|list| list.lookup(ino));
        let entry = match lookup(id.ino) {
            Some(entry) => entry,
            None if self.config.listed_only() => {
                // Unlisted object in listed-only mode: admit under the
                // developer origin, defining a blank one on first use.
                let mut src_id = self.config.devorig();
                if src_id == 0 {
                    src_id = self.creds.define_source("");
                    if src_id <= 0 {
                        return Err(Reason::SourceId);
                    }
                    self.config.set_devorig(src_id);
                }
                if !self.sid_check(&name, src_id, invoker) {
                    return Err(Reason::SourceId);
                }
                self.cache.insert(id, src_id);
                return Ok(());
            }
            None => {
                // Ask the helper for this volume's hashes, then look again.
                self.load_volume_hashes(id).map_err(|_| Reason::LoadFailed)?;
                lookup(id.ino).ok_or(Reason::NoReferenceHash)?
            }
        };

        if !self.sid_check(&name, entry.src_id, invoker) {
            return Err(Reason::SourceId);
        }
        if !self.attrib_check(id, &entry) {
            return Err(Reason::Attribute);
        }
        self.hash_check(id, &entry)?;
        self.cache.insert(id, entry.src_id);
        Ok(())
    }

    /// The data-open verification sequence. No cache involvement: static
    /// data is measured on every open.
    pub(crate) fn data_validation(&self, id: FileId) -> Result<(), Reason> {
        let meta = match self.fs.metadata(id) {
            Ok(meta) => meta,
            Err(_) => return Ok(()),
        };
        // Directory listings are always permitted.
        if meta.kind == FileKind::Directory {
            return Ok(());
        }
        let protected_parent = self
            .fs
            .parent(id)
            .map(|parent| {
                self.volumes
                    .get(parent.dev)
                    .map(|list| list.contains(parent.ino))
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if !protected_parent {
            return Ok(());
        }
        let entry = self
            .volumes
            .get(id.dev)
            .and_then(|list| list.lookup(id.ino))
            .ok_or(Reason::NoReferenceHash)?;
        if entry.nodetype == crate::types::NodeType::DynamicData {
            return Ok(());
        }
        if !self.attrib_check(id, &entry) {
            return Err(Reason::Attribute);
        }
        self.hash_check(id, &entry)?;
        Ok(())
    }

    /// May `invoker` modify `id`? True when the object carries no
    /// write-credential list, or when the invoker holds any one pair.
    pub(crate) fn check_write_perm(&self, id: FileId, invoker: &Invoker) -> bool {
        let wcreds = match self.volumes.get(id.dev).and_then(|list| list.get_wcreds(id.ino)) {
            Some(wcreds) => wcreds,
            None => return true,
        };
        wcreds
            .iter()
            .any(|cred| self.creds.has_credential(invoker, *cred))
    }

    /// Which enforce bit governs a failure of `reason` under `hook`.
    fn enforcing_for(&self, hook: Hook, reason: Reason) -> bool {
        let enforce = self.config.enforce();
        match hook {
            Hook::DataOpen => enforce.contains(EnforceFlags::DATA_OPEN),
            _ => match reason {
                Reason::SourceId => enforce.contains(EnforceFlags::SOURCE_ID),
                Reason::Attribute => enforce.contains(EnforceFlags::ATTRIB),
                _ => enforce.contains(EnforceFlags::HASH_CHECK),
            },
        }
    }

    fn denial_for(hook: Hook) -> Denial {
        match hook {
            Hook::DataOpen => Denial::AccessDenied,
            Hook::Mmap | Hook::Exec => Denial::NotPermitted,
        }
    }

    /// Turn an evaluation result into the hook's return status, logging
    /// and notifying on real violations.
    pub(crate) fn dispose(
        &self,
        result: Result<(), Reason>,
        hook: Hook,
        id: FileId,
        invoker: &Invoker,
    ) -> Result<(), Denial> {
        let reason = match result {
            Ok(()) => return Ok(()),
            Err(reason) => reason,
        };
        let enforcing = self.enforcing_for(hook, reason);
        if reason == Reason::Interrupted {
            // Not a violation: no log, no notification. Enforcing mode
            // still refuses to admit unmeasured content.
            return if enforcing {
                Err(Denial::Interrupted)
            } else {
                Ok(())
            };
        }
        error!(
            "{} verification failed ({})",
            self.fs.name_of(id),
            reason.message()
        );
        self.notifier.notify(
            reason,
            hook,
            &invoker.process,
            self.fs.path_of(id).as_deref(),
        );
        if enforcing {
            Err(Self::denial_for(hook))
        } else {
            Ok(())
        }
    }

    /// Verify a file for execution or executable mapping.
    pub fn check_executable(
        &self,
        file: &OpenFile,
        hook: Hook,
        invoker: &Invoker,
    ) -> Result<(), Denial> {
        match self.initialize_root_hashlist(file, invoker) {
            Ok(crate::bootstrap::BootstrapCheck::HelperAdmitted) => return Ok(()),
            Ok(crate::bootstrap::BootstrapCheck::Proceed) => {}
            Err(()) => {
                return if self.config.enforce().contains(EnforceFlags::HASH_CHECK) {
                    Err(Self::denial_for(hook))
                } else {
                    Ok(())
                };
            }
        }
        let result = self.exe_validation(file.id, invoker);
        self.dispose(result, hook, file.id, invoker)
    }

    /// Verify a data file being opened inside a protected directory.
    pub fn check_data_open(&self, file: &OpenFile, invoker: &Invoker) -> Result<(), Denial> {
        let result = self.data_validation(file.id);
        self.dispose(result, Hook::DataOpen, file.id, invoker)
    }
}
