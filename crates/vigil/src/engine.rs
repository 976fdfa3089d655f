//! The validator engine: one value owning every component.
//!
//! [`Validator`] ties together the configuration surface, the verification
//! cache, the per-volume hashlist registry, the module whitelist, the
//! notification channel, and the side tables that stand in for per-inode
//! and per-file state slots. Host collaborators — filesystem, credential
//! service, platform facts, helper invocation — are injected as trait
//! objects at construction.
//!
//! The enforcement hooks live in [`crate::gateway`], the policy evaluation
//! in [`crate::policy`], the bootstrap protocol in [`crate::bootstrap`],
//! and the userspace control surface in [`crate::control`]; they are all
//! `impl Validator` blocks over this state.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use log::{error, info};

use crate::cache::VerifyCache;
use crate::config::{Config, EnableFlags, EnforceFlags};
use crate::creds::{CredentialService, HelperInvoker, Platform};
use crate::fs::Filesystem;
use crate::hashlist::Volumes;
use crate::modlist::ModuleWhitelist;
use crate::notify::Notifier;
use crate::types::{FileId, Sha1Digest, SHA1_LEN};

/// An open file description: one `open()` of a file. The defended-for-exec
/// bit is per open description, while the defence counter is per inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFile {
    /// Unique handle of this open description.
    pub handle: u64,
    /// The underlying filesystem object.
    pub id: FileId,
}

/// Engine construction options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Seed for the verification-cache bucket count (rounded up to a power
    /// of two).
    pub cache_buckets: usize,
    /// Path of the userspace helper that populates reference hashlists.
    pub helper_path: PathBuf,
    /// Digest that authorizes the helper's first execution, normally
    /// installed from the `vhash=` kernel command-line parameter.
    pub vhash: Option<Sha1Digest>,
    /// Initial enable bits.
    pub enable: EnableFlags,
    /// Initial enforce bits.
    pub enforce: EnforceFlags,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache_buckets: VerifyCache::default_buckets(),
            helper_path: PathBuf::from("/sbin/vigil-init"),
            vhash: None,
            enable: EnableFlags::HASH_CHECK,
            enforce: EnforceFlags::empty(),
        }
    }
}

/// Parse a `vhash=` command-line value: exactly 40 hex characters, either
/// case. Anything else is logged and ignored.
pub fn parse_vhash(input: &str) -> Option<Sha1Digest> {
    if input.len() != 2 * SHA1_LEN || !input.bytes().all(|b| b.is_ascii_hexdigit()) {
        error!("bad vhash parameter {input:?}");
        return None;
    }
    let mut digest = [0u8; SHA1_LEN];
    hex::decode_to_slice(input.to_ascii_lowercase(), &mut digest).ok()?;
    Some(digest)
}

/// The integrity enforcement engine.
pub struct Validator {
    pub(crate) config: Config,
    pub(crate) cache: VerifyCache,
    pub(crate) volumes: Arc<Volumes>,
    pub(crate) modlist: ModuleWhitelist,
    pub(crate) notifier: Notifier,

    pub(crate) fs: Arc<dyn Filesystem>,
    pub(crate) creds: Arc<dyn CredentialService>,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) helper: Arc<dyn HelperInvoker>,
    pub(crate) helper_path: PathBuf,
    pub(crate) vhash: Option<Sha1Digest>,

    /// Per-inode measurement locks, so parallel mmaps of one binary digest
    /// it once.
    inode_locks: Mutex<HashMap<FileId, Arc<Mutex<()>>>>,
    /// Write-defence counters: how many open descriptions hold each inode
    /// mmapped for execution.
    pub(crate) defence_counts: Mutex<HashMap<FileId, u64>>,
    /// Open descriptions currently holding a defence (makes releases
    /// idempotent).
    pub(crate) defended_files: Mutex<HashSet<u64>>,
    /// Serializes userspace helper invocations across volumes.
    pub(crate) helper_lock: Mutex<()>,

    next_handle: AtomicU64,
}

impl Validator {
    /// Build an engine from options and host collaborators.
    pub fn new(
        options: Options,
        fs: Arc<dyn Filesystem>,
        creds: Arc<dyn CredentialService>,
        platform: Arc<dyn Platform>,
        helper: Arc<dyn HelperInvoker>,
    ) -> Self {
        match options.vhash {
            Some(digest) => info!("init vhash={}", hex::encode(digest)),
            None => info!("init - vhash is not set"),
        }
        Self {
            config: Config::new(options.enable, options.enforce),
            cache: VerifyCache::new(options.cache_buckets),
            volumes: Arc::new(Volumes::new()),
            modlist: ModuleWhitelist::new(),
            notifier: Notifier::new(),
            fs,
            creds,
            platform,
            helper,
            helper_path: options.helper_path,
            vhash: options.vhash,
            inode_locks: Mutex::new(HashMap::new()),
            defence_counts: Mutex::new(HashMap::new()),
            defended_files: Mutex::new(HashSet::new()),
            helper_lock: Mutex::new(()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Mint an [`OpenFile`] for a host open description.
    pub fn open_file(&self, id: FileId) -> OpenFile {
        OpenFile {
            handle: self.next_handle.fetch_add(1, Ordering::Relaxed),
            id,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &VerifyCache {
        &self.cache
    }

    pub fn volumes(&self) -> &Volumes {
        &self.volumes
    }

    /// Shared handle to the volume registry, e.g. for a helper that writes
    /// entries while the engine waits for it.
    pub fn volumes_shared(&self) -> Arc<Volumes> {
        Arc::clone(&self.volumes)
    }

    pub fn modlist(&self) -> &ModuleWhitelist {
        &self.modlist
    }

    /// Subscribe to violation notifications.
    pub fn subscribe(&self) -> Receiver<String> {
        self.notifier.subscribe()
    }

    /// The per-inode measurement lock for `id`, created on first use.
    pub(crate) fn inode_lock(&self, id: FileId) -> Arc<Mutex<()>> {
        self.inode_locks
            .lock()
            .expect("inode lock table poisoned")
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop side-table state for a released inode.
    pub(crate) fn release_inode_state(&self, id: FileId) {
        self.inode_locks
            .lock()
            .expect("inode lock table poisoned")
            .remove(&id);
        self.defence_counts
            .lock()
            .expect("defence table poisoned")
            .remove(&id);
    }

    /// Current write-defence count on an inode.
    pub fn defence_count(&self, id: FileId) -> u64 {
        self.defence_counts
            .lock()
            .expect("defence table poisoned")
            .get(&id)
            .copied()
            .unwrap_or(0)
    }
}
