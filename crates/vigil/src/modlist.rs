//! Kernel-module whitelist: the digests of modules authorized to load.
//!
//! A small hash set of SHA-1 values. The first digest byte selects one of
//! 32 buckets; the whole table shares a single reader/writer lock since
//! module loads are rare. Entries are only ever added — the list lives for
//! the lifetime of the engine.

use std::sync::RwLock;

use log::error;

use crate::digest::digest_buffer;
use crate::types::{Sha1Digest, SHA1_LEN};

/// Bucket count of the whitelist table.
pub const MOD_BUCKETS: usize = 32;

/// Set of authorized kernel-module digests.
pub struct ModuleWhitelist {
    buckets: RwLock<Vec<Vec<Sha1Digest>>>,
}

impl Default for ModuleWhitelist {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleWhitelist {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(vec![Vec::new(); MOD_BUCKETS]),
        }
    }

    fn bucket_index(digest: &Sha1Digest) -> usize {
        digest[0] as usize % MOD_BUCKETS
    }

    /// Authorize a module digest. Duplicates are accepted silently.
    pub fn authorize(&self, digest: Sha1Digest) {
        let mut buckets = self.buckets.write().expect("modlist lock poisoned");
        let bucket = &mut buckets[Self::bucket_index(&digest)];
        if !bucket.contains(&digest) {
            bucket.push(digest);
        }
    }

    /// Authorize from a raw control-surface write: the first 20 bytes of
    /// `data` are the digest. Shorter writes are rejected.
    pub fn authorize_raw(&self, data: &[u8]) -> Result<(), ()> {
        if data.len() < SHA1_LEN {
            error!("module digest write too short ({} bytes)", data.len());
            return Err(());
        }
        let mut digest = [0u8; SHA1_LEN];
        digest.copy_from_slice(&data[..SHA1_LEN]);
        self.authorize(digest);
        Ok(())
    }

    /// Is this digest authorized?
    pub fn contains(&self, digest: &Sha1Digest) -> bool {
        self.buckets.read().expect("modlist lock poisoned")[Self::bucket_index(digest)]
            .contains(digest)
    }

    /// Digest a module image and test it against the whitelist. The caller
    /// decides whether module checking is enabled at all.
    pub fn check(&self, module: &[u8]) -> bool {
        let digest = digest_buffer(module);
        let ok = self.contains(&digest);
        if !ok {
            error!("module verification failed ({})", hex::encode(digest));
        }
        ok
    }

    /// Number of authorized digests.
    pub fn len(&self) -> usize {
        self.buckets
            .read()
            .expect("modlist lock poisoned")
            .iter()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable dump: hex digests grouped by bucket.
    pub fn dump(&self) -> String {
        let buckets = self.buckets.read().expect("modlist lock poisoned");
        let mut out = String::new();
        for (index, bucket) in buckets.iter().enumerate() {
            out.push_str(&format!("Line: {index:03}\n"));
            for digest in bucket {
                out.push_str(&hex::encode(digest));
                out.push('\n');
            }
        }
        out
    }
}
