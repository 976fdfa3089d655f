//! Filesystem facade for the vigil engine.
//!
//! The engine never touches a filesystem directly; it sees hosts through the
//! narrow [`Filesystem`] trait: object identity ([`FileId`]), metadata,
//! positional content reads, parent lookup, pathnames for diagnostics, and
//! writer-count visibility.
//!
//! Two implementations ship with the crate:
//! - [`MemFs`] — an in-memory filesystem for tests and embedding hosts. It
//!   supports content replacement, writer-count control, and read-fault
//!   injection so the interrupted-measurement path can be exercised.
//! - [`StdFs`] — maps real paths through `std::fs` for the CLI.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::types::{FileId, FileKind, FileMeta};

/// Host filesystem facilities the engine consumes.
///
/// All methods take [`FileId`] keys; the host owns the mapping from its own
/// file objects to stable identifiers.
pub trait Filesystem: Send + Sync {
    /// Current metadata of the object.
    fn metadata(&self, id: FileId) -> io::Result<FileMeta>;

    /// Read file content at `offset` into `buf`, returning the number of
    /// bytes read. A return of `0` means end of file.
    fn read_at(&self, id: FileId, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Identity of the parent directory, if known.
    fn parent(&self, id: FileId) -> Option<FileId>;

    /// Absolute pathname for diagnostics and notifications, if known.
    fn path_of(&self, id: FileId) -> Option<PathBuf>;

    /// Number of writers currently holding the object open for writing.
    fn writecount(&self, id: FileId) -> u32;

    /// Mount-point pathname of a volume, used when requesting hashes for a
    /// volume other than the root.
    fn mount_point(&self, dev: u64) -> Option<PathBuf>;

    /// Short name for log lines. Defaults to the last path component.
    fn name_of(&self, id: FileId) -> String {
        self.path_of(id)
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| format!("ino:{}", id.ino))
    }
}

// ── In-memory filesystem ─────────────────────────────────────────────────────

struct MemNode {
    meta: FileMeta,
    content: Vec<u8>,
    parent: Option<FileId>,
    path: PathBuf,
    writecount: u32,
    /// Remaining reads that will fail with `ErrorKind::Interrupted`.
    interrupts: u32,
    /// Successful `read_at` calls, for tests that count measurements.
    reads: u64,
}

/// In-memory [`Filesystem`] for tests and embedding hosts.
///
/// Cheap to share — all state lives behind a `Mutex`. Mutators deliberately
/// mirror what a host kernel would do underneath the engine: replacing
/// content, changing attributes, adjusting the writer count.
pub struct MemFs {
    nodes: Mutex<HashMap<FileId, MemNode>>,
    mounts: Mutex<HashMap<u64, PathBuf>>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            mounts: Mutex::new(HashMap::new()),
        }
    }

    /// Add a regular file. Replaces any node previously registered for `id`.
    pub fn add_file(
        &self,
        id: FileId,
        path: &str,
        content: &[u8],
        uid: u32,
        gid: u32,
        mode: u32,
    ) {
        self.insert_node(id, path, content.to_vec(), uid, gid, mode, FileKind::Regular);
    }

    /// Add a directory node.
    pub fn add_dir(&self, id: FileId, path: &str, uid: u32, gid: u32, mode: u32) {
        self.insert_node(id, path, Vec::new(), uid, gid, mode, FileKind::Directory);
    }

    /// Add a device node.
    pub fn add_device(&self, id: FileId, path: &str, kind: FileKind) {
        self.insert_node(id, path, Vec::new(), 0, 0, 0o600, kind);
    }

    fn insert_node(
        &self,
        id: FileId,
        path: &str,
        content: Vec<u8>,
        uid: u32,
        gid: u32,
        mode: u32,
        kind: FileKind,
    ) {
        let size = content.len() as u64;
        let node = MemNode {
            meta: FileMeta {
                uid,
                gid,
                mode,
                size,
                nlink: 1,
                kind,
            },
            content,
            parent: None,
            path: PathBuf::from(path),
            writecount: 0,
            interrupts: 0,
            reads: 0,
        };
        self.nodes
            .lock()
            .expect("MemFs mutex poisoned")
            .insert(id, node);
    }

    /// Record `parent` as the parent directory of `id`.
    pub fn set_parent(&self, id: FileId, parent: FileId) {
        if let Some(node) = self.nodes.lock().expect("MemFs mutex poisoned").get_mut(&id) {
            node.parent = Some(parent);
        }
    }

    /// Replace file content, as a host write would.
    pub fn write(&self, id: FileId, content: &[u8]) {
        if let Some(node) = self.nodes.lock().expect("MemFs mutex poisoned").get_mut(&id) {
            node.content = content.to_vec();
            node.meta.size = content.len() as u64;
        }
    }

    /// Set the number of concurrent writers on the object.
    pub fn set_writecount(&self, id: FileId, count: u32) {
        if let Some(node) = self.nodes.lock().expect("MemFs mutex poisoned").get_mut(&id) {
            node.writecount = count;
        }
    }

    /// Set the hard link count.
    pub fn set_nlink(&self, id: FileId, nlink: u32) {
        if let Some(node) = self.nodes.lock().expect("MemFs mutex poisoned").get_mut(&id) {
            node.meta.nlink = nlink;
        }
    }

    /// Change owner/group/mode, as a host chown/chmod would.
    pub fn set_attrs(&self, id: FileId, uid: u32, gid: u32, mode: u32) {
        if let Some(node) = self.nodes.lock().expect("MemFs mutex poisoned").get_mut(&id) {
            node.meta.uid = uid;
            node.meta.gid = gid;
            node.meta.mode = mode;
        }
    }

    /// Number of successful reads performed on `id` so far.
    pub fn read_count(&self, id: FileId) -> u64 {
        self.nodes
            .lock()
            .expect("MemFs mutex poisoned")
            .get(&id)
            .map(|n| n.reads)
            .unwrap_or(0)
    }

    /// Make the next `count` reads of `id` fail with `ErrorKind::Interrupted`.
    pub fn interrupt_reads(&self, id: FileId, count: u32) {
        if let Some(node) = self.nodes.lock().expect("MemFs mutex poisoned").get_mut(&id) {
            node.interrupts = count;
        }
    }

    /// Register a mount point for a device.
    pub fn add_mount(&self, dev: u64, path: &str) {
        self.mounts
            .lock()
            .expect("MemFs mutex poisoned")
            .insert(dev, PathBuf::from(path));
    }

    /// Drop a node entirely (host inode release).
    pub fn remove(&self, id: FileId) {
        self.nodes.lock().expect("MemFs mutex poisoned").remove(&id);
    }
}

impl Filesystem for MemFs {
    fn metadata(&self, id: FileId) -> io::Result<FileMeta> {
        self.nodes
            .lock()
            .expect("MemFs mutex poisoned")
            .get(&id)
            .map(|n| n.meta)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such node"))
    }

    fn read_at(&self, id: FileId, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut nodes = self.nodes.lock().expect("MemFs mutex poisoned");
        let node = nodes
            .get_mut(&id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such node"))?;
        if node.interrupts > 0 {
            node.interrupts -= 1;
            return Err(io::Error::new(io::ErrorKind::Interrupted, "signal delivered"));
        }
        let start = (offset as usize).min(node.content.len());
        let end = (start + buf.len()).min(node.content.len());
        let n = end - start;
        buf[..n].copy_from_slice(&node.content[start..end]);
        node.reads += 1;
        Ok(n)
    }

    fn parent(&self, id: FileId) -> Option<FileId> {
        self.nodes
            .lock()
            .expect("MemFs mutex poisoned")
            .get(&id)
            .and_then(|n| n.parent)
    }

    fn path_of(&self, id: FileId) -> Option<PathBuf> {
        self.nodes
            .lock()
            .expect("MemFs mutex poisoned")
            .get(&id)
            .map(|n| n.path.clone())
    }

    fn writecount(&self, id: FileId) -> u32 {
        self.nodes
            .lock()
            .expect("MemFs mutex poisoned")
            .get(&id)
            .map(|n| n.writecount)
            .unwrap_or(0)
    }

    fn mount_point(&self, dev: u64) -> Option<PathBuf> {
        self.mounts
            .lock()
            .expect("MemFs mutex poisoned")
            .get(&dev)
            .cloned()
    }
}

// ── Real-path filesystem ─────────────────────────────────────────────────────

/// [`Filesystem`] over real paths via `std::fs`, for the CLI.
///
/// Identifiers come from the host inode numbers; [`StdFs::resolve`]
/// registers a path and returns its [`FileId`].
pub struct StdFs {
    paths: Mutex<HashMap<FileId, PathBuf>>,
}

impl Default for StdFs {
    fn default() -> Self {
        Self::new()
    }
}

impl StdFs {
    pub fn new() -> Self {
        Self {
            paths: Mutex::new(HashMap::new()),
        }
    }

    /// Register `path` and return its [`FileId`] (device + inode from the
    /// host metadata).
    pub fn resolve(&self, path: &Path) -> io::Result<FileId> {
        use std::os::unix::fs::MetadataExt;

        let md = std::fs::metadata(path)?;
        let id = FileId::new(md.dev(), md.ino());
        self.paths
            .lock()
            .expect("StdFs mutex poisoned")
            .insert(id, path.to_path_buf());
        Ok(id)
    }

    fn path_for(&self, id: FileId) -> io::Result<PathBuf> {
        self.paths
            .lock()
            .expect("StdFs mutex poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unregistered file id"))
    }
}

impl Filesystem for StdFs {
    fn metadata(&self, id: FileId) -> io::Result<FileMeta> {
        use std::os::unix::fs::MetadataExt;

        let md = std::fs::metadata(self.path_for(id)?)?;
        let kind = if md.is_dir() {
            FileKind::Directory
        } else if md.is_file() {
            FileKind::Regular
        } else {
            FileKind::Other
        };
        Ok(FileMeta {
            uid: md.uid(),
            gid: md.gid(),
            mode: md.mode(),
            size: md.size(),
            nlink: md.nlink() as u32,
            kind,
        })
    }

    fn read_at(&self, id: FileId, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = std::fs::File::open(self.path_for(id)?)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read(buf)
    }

    fn parent(&self, id: FileId) -> Option<FileId> {
        let path = self.path_for(id).ok()?;
        let parent = path.parent()?;
        self.resolve(parent).ok()
    }

    fn path_of(&self, id: FileId) -> Option<PathBuf> {
        self.path_for(id).ok()
    }

    fn writecount(&self, _id: FileId) -> u32 {
        // Writer counts are not observable through std::fs; the CLI treats
        // every file as quiescent.
        0
    }

    fn mount_point(&self, _dev: u64) -> Option<PathBuf> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fs() -> MemFs {
        let fs = MemFs::new();
        fs.add_file(FileId::new(1, 10), "/bin/app", b"binary bits", 0, 0, 0o755);
        fs
    }

    // ── MemFs metadata / reads ───────────────────────────────────────────────

    #[test]
    fn test_memfs_metadata_round_trip() {
        let fs = sample_fs();
        let meta = fs.metadata(FileId::new(1, 10)).expect("metadata");
        assert_eq!(meta.uid, 0);
        assert_eq!(meta.mode, 0o755);
        assert_eq!(meta.size, 11);
        assert_eq!(meta.kind, FileKind::Regular);
    }

    #[test]
    fn test_memfs_missing_node_is_not_found() {
        let fs = sample_fs();
        let err = fs.metadata(FileId::new(9, 9)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_memfs_read_at_offsets() {
        let fs = sample_fs();
        let id = FileId::new(1, 10);
        let mut buf = [0u8; 6];
        assert_eq!(fs.read_at(id, 0, &mut buf).expect("read"), 6);
        assert_eq!(&buf, b"binary");
        // Short tail read.
        assert_eq!(fs.read_at(id, 7, &mut buf).expect("read"), 4);
        assert_eq!(&buf[..4], b"bits");
        // Past EOF reads zero bytes.
        assert_eq!(fs.read_at(id, 100, &mut buf).expect("read"), 0);
    }

    #[test]
    fn test_memfs_write_replaces_content() {
        let fs = sample_fs();
        let id = FileId::new(1, 10);
        fs.write(id, b"new");
        let meta = fs.metadata(id).expect("metadata");
        assert_eq!(meta.size, 3);
        let mut buf = [0u8; 8];
        assert_eq!(fs.read_at(id, 0, &mut buf).expect("read"), 3);
        assert_eq!(&buf[..3], b"new");
    }

    #[test]
    fn test_memfs_interrupt_injection() {
        let fs = sample_fs();
        let id = FileId::new(1, 10);
        fs.interrupt_reads(id, 1);
        let mut buf = [0u8; 4];
        let err = fs.read_at(id, 0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        // The fault is consumed; the next read succeeds.
        assert!(fs.read_at(id, 0, &mut buf).is_ok());
    }

    #[test]
    fn test_memfs_parent_and_name() {
        let fs = sample_fs();
        let dir = FileId::new(1, 2);
        fs.add_dir(dir, "/bin", 0, 0, 0o755);
        fs.set_parent(FileId::new(1, 10), dir);
        assert_eq!(fs.parent(FileId::new(1, 10)), Some(dir));
        assert_eq!(fs.name_of(FileId::new(1, 10)), "app");
    }

    #[test]
    fn test_memfs_writecount_and_mounts() {
        let fs = sample_fs();
        let id = FileId::new(1, 10);
        assert_eq!(fs.writecount(id), 0);
        fs.set_writecount(id, 2);
        assert_eq!(fs.writecount(id), 2);
        fs.add_mount(1, "/");
        assert_eq!(fs.mount_point(1), Some(PathBuf::from("/")));
        assert_eq!(fs.mount_point(7), None);
    }

    // ── StdFs ────────────────────────────────────────────────────────────────

    #[test]
    fn test_stdfs_resolve_and_read() {
        use std::io::Write;

        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(b"stdfs content").expect("write");
        let fs = StdFs::new();
        let id = fs.resolve(tmp.path()).expect("resolve");
        let meta = fs.metadata(id).expect("metadata");
        assert_eq!(meta.size, 13);
        let mut buf = [0u8; 5];
        assert_eq!(fs.read_at(id, 6, &mut buf).expect("read"), 5);
        assert_eq!(&buf, b"conte");
    }

    #[test]
    fn test_stdfs_unregistered_id_fails() {
        let fs = StdFs::new();
        let err = fs.metadata(FileId::new(1, 1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
