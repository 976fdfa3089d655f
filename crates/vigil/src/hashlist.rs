//! Reference hashlist: per-volume trusted descriptions of protected files.
//!
//! Each mounted volume owns one [`HashList`] — 1024 buckets of entries
//! keyed by inode number, each bucket behind its own reader/writer lock.
//! The [`Volumes`] registry maps device identifiers to their hashlists and
//! stands in for a per-superblock attachment slot; destroying a volume
//! drops its whole list.
//!
//! ## Ingestion grammar
//!
//! Entries arrive one record per write through the control surface. A
//! record is a one-byte type tag, an optional raw 20-byte SHA-1 digest,
//! decimal text fields, and a NUL-then-newline terminator:
//!
//! ```text
//! 's'|'t' <digest[20]> device ino uid gid mode src_id ncreds (ctype cvalue)*  \0\n
//! 'x'|'d'|'p'          device ino uid gid mode src_id ncreds (ctype cvalue)*  \0\n
//! 'a'     <digest[20]> device ino <free-text source id>                       \0\n
//! ```
//!
//! `'a'` and `'s'` both describe executables; `'a'` is the legacy form
//! whose free-text source identifier is resolved through the credential
//! service. `'t'` marks static data, `'x'` dynamic data, `'d'` immutable
//! directories, and `'p'` protected directories. Records longer than one
//! page or shorter than the per-type minimum are rejected. A batch is
//! applied record by record; earlier records stay applied when a later one
//! fails.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::info;
use thiserror::Error;

use crate::creds::CredentialService;
use crate::types::{hash_long, NodeType, RefEntry, Sha1Digest, WriteCred, SHA1_LEN};

/// Bucket-index width of one volume's hashlist.
const HASHLIST_BITS: u32 = 10;

/// Buckets per volume.
pub const HASHLIST_BUCKETS: usize = 1 << HASHLIST_BITS;

/// Floor for any record: tag, a few single-digit fields, terminator.
pub const SHORT_MESSAGE_MIN_LENGTH: usize = 14;

/// Floor for digest-bearing records.
pub const HASH_MESSAGE_MIN_LENGTH: usize = 1 + SHA1_LEN + 5;

/// Longest accepted record (one page).
pub const MAX_MESSAGE_LENGTH: usize = 4096;

/// Record rejection causes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("record too short ({0} bytes)")]
    TooShort(usize),
    #[error("record too long ({0} bytes)")]
    TooLong(usize),
    #[error("record is not NUL-then-newline terminated")]
    BadTermination,
    #[error("unknown record tag {0:?}")]
    BadTag(char),
    #[error("malformed record fields")]
    BadFields,
    #[error("malformed write-credential list")]
    BadCreds,
}

/// One volume's reference hashlist.
pub struct HashList {
    buckets: Vec<RwLock<Vec<RefEntry>>>,
}

impl Default for HashList {
    fn default() -> Self {
        Self::new()
    }
}

impl HashList {
    pub fn new() -> Self {
        Self {
            buckets: (0..HASHLIST_BUCKETS).map(|_| RwLock::new(Vec::new())).collect(),
        }
    }

    fn bucket(&self, ino: u64) -> &RwLock<Vec<RefEntry>> {
        &self.buckets[hash_long(ino, HASHLIST_BITS)]
    }

    /// Add or replace the entry for `entry.ino`. Replacing drops the prior
    /// entry together with its write-credential list.
    pub fn insert(&self, entry: RefEntry) {
        let mut bucket = self.bucket(entry.ino).write().expect("hashlist bucket poisoned");
        bucket.retain(|existing| existing.ino != entry.ino);
        bucket.push(entry);
    }

    /// Snapshot of the entry for `ino`, if present.
    pub fn lookup(&self, ino: u64) -> Option<RefEntry> {
        self.bucket(ino)
            .read()
            .expect("hashlist bucket poisoned")
            .iter()
            .find(|entry| entry.ino == ino)
            .cloned()
    }

    /// Is there an entry for `ino`?
    pub fn contains(&self, ino: u64) -> bool {
        self.bucket(ino)
            .read()
            .expect("hashlist bucket poisoned")
            .iter()
            .any(|entry| entry.ino == ino)
    }

    /// Write-credential list of the entry for `ino`, if any.
    pub fn get_wcreds(&self, ino: u64) -> Option<Vec<WriteCred>> {
        self.bucket(ino)
            .read()
            .expect("hashlist bucket poisoned")
            .iter()
            .find(|entry| entry.ino == ino)
            .and_then(|entry| entry.wcreds.clone())
    }

    /// Remove the entry for `ino`. Returns whether one existed.
    pub fn delete(&self, ino: u64) -> bool {
        let mut bucket = self.bucket(ino).write().expect("hashlist bucket poisoned");
        let before = bucket.len();
        bucket.retain(|entry| entry.ino != ino);
        bucket.len() != before
    }

    /// Number of entries across all buckets.
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.read().expect("hashlist bucket poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable dump: non-empty buckets with one line per entry.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (index, bucket) in self.buckets.iter().enumerate() {
            let bucket = bucket.read().expect("hashlist bucket poisoned");
            if bucket.is_empty() {
                continue;
            }
            out.push_str(&format!("Line: {index:03}\n"));
            for entry in bucket.iter() {
                out.push_str(&format!(
                    "{}\t{:8}\t({},{},{}){} {}\t{}\n",
                    entry.src_id,
                    entry.ino,
                    entry.uid,
                    entry.gid,
                    entry.mode,
                    entry.nodetype.dump_code(),
                    if entry.wcreds.is_some() { "creds " } else { "no    " },
                    hex::encode(entry.digest),
                ));
            }
        }
        out
    }
}

/// Registry of per-volume hashlists, keyed by device identifier.
///
/// Volumes gain a hashlist lazily on first entry insertion and lose it when
/// the host tears the volume down.
pub struct Volumes {
    map: Mutex<HashMap<u64, Arc<HashList>>>,
}

impl Default for Volumes {
    fn default() -> Self {
        Self::new()
    }
}

impl Volumes {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// The hashlist of `dev`, if the volume has one.
    pub fn get(&self, dev: u64) -> Option<Arc<HashList>> {
        self.map.lock().expect("volume registry poisoned").get(&dev).cloned()
    }

    /// The hashlist of `dev`, creating an empty one on first use.
    pub fn get_or_create(&self, dev: u64) -> Arc<HashList> {
        let mut map = self.map.lock().expect("volume registry poisoned");
        map.entry(dev)
            .or_insert_with(|| {
                info!("creating reference hashlist for device {dev}");
                Arc::new(HashList::new())
            })
            .clone()
    }

    /// Drop the hashlist of `dev` (volume teardown). Returns whether one
    /// existed.
    pub fn destroy(&self, dev: u64) -> bool {
        self.map.lock().expect("volume registry poisoned").remove(&dev).is_some()
    }

    /// Parse one ingestion record and apply it.
    pub fn ingest(&self, data: &[u8], creds: &dyn CredentialService) -> Result<(), ParseError> {
        let (dev, entry) = parse_record(data, creds)?;
        self.get_or_create(dev).insert(entry);
        Ok(())
    }

    /// Human-readable dump of every volume's hashlist.
    pub fn dump(&self) -> String {
        let map = self.map.lock().expect("volume registry poisoned");
        let mut devices: Vec<_> = map.keys().copied().collect();
        devices.sort_unstable();
        let mut out = String::new();
        for dev in devices {
            out.push_str(&format!("Device: {dev}\n"));
            out.push_str(&map[&dev].dump());
        }
        out
    }
}

// ── Record parsing ───────────────────────────────────────────────────────────

/// Split the decimal text fields that follow the tag (and digest, when
/// present) into a token iterator. The terminator has been sliced off.
fn text_fields(body: &[u8]) -> Result<Vec<&str>, ParseError> {
    let text = std::str::from_utf8(body).map_err(|_| ParseError::BadFields)?;
    Ok(text.split_ascii_whitespace().collect())
}

fn parse_num<T: std::str::FromStr>(token: Option<&&str>) -> Result<T, ParseError> {
    token
        .ok_or(ParseError::BadFields)?
        .parse::<T>()
        .map_err(|_| ParseError::BadFields)
}

/// Parse the common numeric body shared by every non-legacy record:
/// `device ino uid gid mode src_id ncreds (ctype cvalue)*`.
fn parse_common_fields(
    body: &[u8],
    nodetype: NodeType,
    digest: Sha1Digest,
) -> Result<(u64, RefEntry), ParseError> {
    let fields = text_fields(body)?;
    let mut iter = fields.iter();
    let device: u64 = parse_num(iter.next())?;
    let ino: u64 = parse_num(iter.next())?;
    let uid: u32 = parse_num(iter.next())?;
    let gid: u32 = parse_num(iter.next())?;
    let mode: u32 = parse_num(iter.next())?;
    let src_id: i64 = parse_num(iter.next())?;
    let ncreds: i64 = parse_num(iter.next())?;
    let wcreds = parse_wcreds(ncreds, &mut iter)?;
    Ok((
        device,
        RefEntry {
            ino,
            nodetype,
            uid,
            gid,
            mode,
            src_id,
            digest,
            wcreds,
        },
    ))
}

/// Parse `ncreds` credential pairs. Zero or negative counts mean DAC alone
/// governs modification.
fn parse_wcreds<'a, I>(ncreds: i64, iter: &mut I) -> Result<Option<Vec<WriteCred>>, ParseError>
where
    I: Iterator<Item = &'a &'a str>,
{
    if ncreds <= 0 {
        return Ok(None);
    }
    let mut creds = Vec::with_capacity(ncreds as usize);
    for _ in 0..ncreds {
        let cred_type: i64 = parse_num(iter.next()).map_err(|_| ParseError::BadCreds)?;
        let cred_value: i64 = parse_num(iter.next()).map_err(|_| ParseError::BadCreds)?;
        creds.push(WriteCred {
            cred_type,
            cred_value,
        });
    }
    Ok(Some(creds))
}

/// Parse the legacy executable record body: `device ino <free-text sid>`.
/// The source string is resolved through the credential service.
fn parse_legacy_fields(
    body: &[u8],
    digest: Sha1Digest,
    creds: &dyn CredentialService,
) -> Result<(u64, RefEntry), ParseError> {
    let text = std::str::from_utf8(body).map_err(|_| ParseError::BadFields)?;
    let mut rest = text.trim_start();
    let mut take_token = |rest: &mut &str| -> Option<String> {
        let token: String = rest.chars().take_while(|c| !c.is_ascii_whitespace()).collect();
        if token.is_empty() {
            return None;
        }
        *rest = rest[token.len()..].trim_start();
        Some(token)
    };
    let device: u64 = take_token(&mut rest)
        .and_then(|t| t.parse().ok())
        .ok_or(ParseError::BadFields)?;
    let ino: u64 = take_token(&mut rest)
        .and_then(|t| t.parse().ok())
        .ok_or(ParseError::BadFields)?;
    if rest.is_empty() {
        return Err(ParseError::BadFields);
    }
    let src_id = creds.define_source(rest);
    Ok((
        device,
        RefEntry {
            ino,
            nodetype: NodeType::Executable,
            uid: 0,
            gid: 0,
            mode: 0,
            src_id,
            digest,
            wcreds: None,
        },
    ))
}

/// Parse one wire record into `(device, entry)`.
pub fn parse_record(
    data: &[u8],
    creds: &dyn CredentialService,
) -> Result<(u64, RefEntry), ParseError> {
    if data.len() < SHORT_MESSAGE_MIN_LENGTH {
        return Err(ParseError::TooShort(data.len()));
    }
    if data.len() > MAX_MESSAGE_LENGTH {
        return Err(ParseError::TooLong(data.len()));
    }
    if data[data.len() - 1] != b'\n' || data[data.len() - 2] != 0 {
        return Err(ParseError::BadTermination);
    }
    let tag = data[0];
    let body = &data[1..data.len() - 2];
    let with_digest = matches!(tag, b'a' | b's' | b't');
    if with_digest && data.len() < HASH_MESSAGE_MIN_LENGTH {
        return Err(ParseError::TooShort(data.len()));
    }
    let (digest, fields): (Sha1Digest, &[u8]) = if with_digest {
        let mut digest = [0u8; SHA1_LEN];
        digest.copy_from_slice(&body[..SHA1_LEN]);
        (digest, &body[SHA1_LEN..])
    } else {
        ([0u8; SHA1_LEN], body)
    };
    match tag {
        b'a' => parse_legacy_fields(fields, digest, creds),
        b's' => parse_common_fields(fields, NodeType::Executable, digest),
        b't' => parse_common_fields(fields, NodeType::StaticData, digest),
        b'x' => parse_common_fields(fields, NodeType::DynamicData, digest),
        b'd' => parse_common_fields(fields, NodeType::ImmutableDir, digest),
        b'p' => parse_common_fields(fields, NodeType::ProtectedDir, digest),
        other => Err(ParseError::BadTag(other as char)),
    }
}

/// Render an entry as a wire record (the numeric grammar; never the legacy
/// `'a'` form). Used by the CLI and by tests to feed the control surface.
pub fn encode_record(device: u64, entry: &RefEntry) -> Vec<u8> {
    let tag = match entry.nodetype {
        NodeType::Executable => b's',
        NodeType::StaticData => b't',
        NodeType::DynamicData => b'x',
        NodeType::ImmutableDir => b'd',
        NodeType::ProtectedDir => b'p',
    };
    let mut out = vec![tag];
    if entry.nodetype.has_digest() {
        out.extend_from_slice(&entry.digest);
    }
    let mut text = format!(
        "{} {} {} {} {} {} ",
        device, entry.ino, entry.uid, entry.gid, entry.mode, entry.src_id
    );
    match &entry.wcreds {
        None => text.push('0'),
        Some(creds) => {
            text.push_str(&creds.len().to_string());
            for cred in creds {
                text.push_str(&format!(" {} {}", cred.cred_type, cred.cred_value));
            }
        }
    }
    out.extend_from_slice(text.as_bytes());
    out.push(0);
    out.push(b'\n');
    out
}
