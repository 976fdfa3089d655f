//! Enforcement gateway: the event handlers the host kernel dispatches into.
//!
//! Each handler mirrors one host hook. The executable hooks feed the
//! policy evaluator; the inode hooks keep the verification cache and the
//! reference hashlist consistent with filesystem mutation; the superblock
//! hook tears down per-volume state.
//!
//! ## Write defence
//!
//! An executable mapping must not race with writers. `on_mmap` takes a
//! *write defence* on the inode: a per-open-description defended bit (so
//! releases are idempotent) plus a per-inode counter shared by all
//! mmap-for-exec holders. Taking the defence requires that no writer has
//! the file open; while the counter is positive, `on_inode_write_request`
//! refuses writes with "text file busy". The defence is released when the
//! host frees the open description.

use log::{error, info, warn};

use crate::creds::Invoker;
use crate::engine::{OpenFile, Validator};
use crate::notify::NOTIFY_PROTOCOL;
use crate::types::{Denial, FileId, FileKind, Hook};

impl Validator {
    /// Take the write defence for `file`. Returns `Ok(true)` if this call
    /// newly took it, `Ok(false)` if this open description already holds
    /// it, and `Err(TextBusy)` when a writer currently has the file open.
    pub(crate) fn deny_write_access(&self, file: &OpenFile) -> Result<bool, Denial> {
        let mut defended = self.defended_files.lock().expect("defended table poisoned");
        if defended.contains(&file.handle) {
            return Ok(false);
        }
        if self.fs.writecount(file.id) > 0 {
            info!(
                "cannot measure {} while writers hold it open",
                self.fs.name_of(file.id)
            );
            return Err(Denial::TextBusy);
        }
        let mut counts = self.defence_counts.lock().expect("defence table poisoned");
        *counts.entry(file.id).or_insert(0) += 1;
        defended.insert(file.handle);
        Ok(true)
    }

    /// Release the write defence held by `file`, if any.
    pub(crate) fn allow_write_access(&self, file: &OpenFile) {
        let mut defended = self.defended_files.lock().expect("defended table poisoned");
        if !defended.remove(&file.handle) {
            return;
        }
        let mut counts = self.defence_counts.lock().expect("defence table poisoned");
        match counts.get_mut(&file.id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    counts.remove(&file.id);
                }
            }
            _ => warn!("defence counter underflow for ino {}", file.id.ino),
        }
    }

    // ── Executable hooks ─────────────────────────────────────────────────────

    /// Memory-map check. Executable mappings of regular files take the
    /// write defence (held until the description is freed) and then run
    /// the executable verification.
    pub fn on_mmap(
        &self,
        file: &OpenFile,
        prot_exec: bool,
        invoker: &Invoker,
    ) -> Result<(), Denial> {
        if !self.config.engine_enabled() || !prot_exec {
            return Ok(());
        }
        match self.fs.metadata(file.id) {
            Ok(meta) if meta.kind == FileKind::Regular => {}
            _ => return Ok(()),
        }
        self.deny_write_access(file)?;
        self.check_executable(file, Hook::Mmap, invoker)
    }

    /// Program execution check.
    pub fn on_exec(&self, file: &OpenFile, invoker: &Invoker) -> Result<(), Denial> {
        if !self.config.engine_enabled() {
            return Ok(());
        }
        self.check_executable(file, Hook::Exec, invoker)
    }

    /// Open description freed. Releases the write defence if this
    /// description held one.
    pub fn on_file_free(&self, file: &OpenFile) {
        if !self.config.engine_enabled() {
            return;
        }
        self.allow_write_access(file);
    }

    // ── Data-open hook ───────────────────────────────────────────────────────

    /// File open check. Applies only to files inside directories that have
    /// a reference entry: write opens require the writer credentials of
    /// both directory and file, read opens run the data-open verification.
    pub fn on_open(
        &self,
        file: &OpenFile,
        read: bool,
        write: bool,
        invoker: &Invoker,
    ) -> Result<(), Denial> {
        if !self.config.engine_enabled()
            || !self.config.hashlist_ready()
            || !self.config.data_check_enabled()
        {
            return Ok(());
        }
        // The exec hook already covers the file being executed.
        if invoker.in_execve {
            return Ok(());
        }
        let meta = match self.fs.metadata(file.id) {
            Ok(meta) => meta,
            Err(_) => return Ok(()),
        };
        if meta.kind.is_device() {
            return Ok(());
        }
        let parent = match self.fs.parent(file.id) {
            Some(parent) => parent,
            None => {
                info!("no parent entry found for ino {}", file.id.ino);
                return Err(Denial::AccessDenied);
            }
        };
        let parent_listed = self
            .volumes
            .get(parent.dev)
            .map(|list| list.contains(parent.ino))
            .unwrap_or(false);
        if !parent_listed {
            return Ok(());
        }
        if write
            && (!self.check_write_perm(parent, invoker)
                || !self.check_write_perm(file.id, invoker))
        {
            return Err(Denial::AccessDenied);
        }
        if read {
            self.check_data_open(file, invoker)
        } else {
            Ok(())
        }
    }

    // ── Inode hooks ──────────────────────────────────────────────────────────

    /// Inode permission check for writes: refused while the inode is
    /// mmapped for execution; otherwise an admitted write evicts any
    /// cached verification so the content is re-measured on next use.
    pub fn on_inode_write_request(&self, id: FileId) -> Result<(), Denial> {
        if !self.config.engine_enabled() {
            return Ok(());
        }
        if self.defence_count(id) > 0 {
            return Err(Denial::TextBusy);
        }
        self.cache.remove(id);
        Ok(())
    }

    /// New file or directory in `dir`.
    pub fn on_inode_create(&self, dir: FileId, invoker: &Invoker) -> Result<(), Denial> {
        if !self.config.engine_enabled() || !self.config.data_check_enabled() {
            return Ok(());
        }
        if self.check_write_perm(dir, invoker) {
            Ok(())
        } else {
            Err(Denial::AccessDenied)
        }
    }

    /// Rename from `old_dir` to `new_dir`. Both directories must admit the
    /// writer; the moved inode loses its cached verification.
    pub fn on_inode_rename(
        &self,
        old_dir: FileId,
        moved: FileId,
        new_dir: FileId,
        invoker: &Invoker,
    ) -> Result<(), Denial> {
        if !self.config.engine_enabled() {
            return Ok(());
        }
        if self.config.data_check_enabled()
            && (!self.check_write_perm(old_dir, invoker)
                || !self.check_write_perm(new_dir, invoker))
        {
            return Err(Denial::AccessDenied);
        }
        self.cache.remove(moved);
        Ok(())
    }

    /// Unlink of `target` from `dir`. Applies only to files with a
    /// reference entry; removing the last hard link also removes the
    /// entry.
    pub fn on_inode_unlink(
        &self,
        dir: FileId,
        target: FileId,
        invoker: &Invoker,
    ) -> Result<(), Denial> {
        if !self.config.engine_enabled() {
            return Ok(());
        }
        let list = match self.volumes.get(target.dev) {
            Some(list) if list.contains(target.ino) => list,
            _ => return Ok(()),
        };
        if self.config.data_check_enabled()
            && (!self.check_write_perm(dir, invoker)
                || !self.check_write_perm(target, invoker))
        {
            return Err(Denial::AccessDenied);
        }
        self.cache.remove(target);
        let nlink = self.fs.metadata(target).map(|meta| meta.nlink).unwrap_or(1);
        if nlink <= 1 && !list.delete(target.ino) {
            error!("cannot delete reference entry (ino={})", target.ino);
        }
        Ok(())
    }

    /// Inode removed behind the hooks (e.g. after a rename chain).
    /// Best-effort cleanup of cache and hashlist.
    pub fn on_inode_delete(&self, id: FileId) {
        if !self.config.engine_enabled() {
            return;
        }
        self.cache.remove(id);
        if let Some(list) = self.volumes.get(id.dev) {
            if list.contains(id.ino) {
                list.delete(id.ino);
            }
        }
    }

    /// Inode object released by the host. Drops side-table state.
    pub fn on_inode_free(&self, id: FileId) {
        self.release_inode_state(id);
    }

    // ── Module, volume, and channel hooks ────────────────────────────────────

    /// Kernel module load check against the whitelist. Passes
    /// unconditionally while module checking is disabled.
    pub fn on_module_load(&self, module: &[u8]) -> Result<(), Denial> {
        if !self.config.module_check_enabled() {
            return Ok(());
        }
        if self.modlist.check(module) {
            Ok(())
        } else {
            Err(Denial::NotPermitted)
        }
    }

    /// Volume teardown: purge its cache entries and destroy its hashlist.
    pub fn on_sb_free(&self, dev: u64) {
        if !self.config.engine_enabled() {
            return;
        }
        self.cache.purge_device(dev);
        self.volumes.destroy(dev);
    }

    /// The notification channel is outbound-only: userspace sends on its
    /// protocol number are refused.
    pub fn on_netlink_send(&self, protocol: u32) -> Result<(), Denial> {
        if protocol == NOTIFY_PROTOCOL {
            error!("notification channel send blocked");
            return Err(Denial::NotPermitted);
        }
        Ok(())
    }
}
