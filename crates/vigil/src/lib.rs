// vigil: whole-system executable and data-file integrity enforcement engine.

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod control;
pub mod creds;
pub mod digest;
pub mod engine;
pub mod fs;
pub mod gateway;
pub mod hashlist;
pub mod modlist;
pub mod notify;
pub mod policy;
pub mod types;

pub use cache::VerifyCache;
pub use config::{Config, EnableFlags, EnforceFlags};
pub use control::{ControlError, ControlOp};
pub use creds::{
    CredentialService, ExecHelper, FixedPlatform, FnHelper, HelperInvoker, Invoker, Platform,
    StaticCreds,
};
pub use digest::{digest_buffer, digest_file, verify_refhash, DigestError};
pub use engine::{parse_vhash, OpenFile, Options, Validator};
pub use fs::{Filesystem, MemFs, StdFs};
pub use hashlist::{encode_record, parse_record, HashList, ParseError, Volumes};
pub use modlist::ModuleWhitelist;
pub use notify::{Notifier, NOTIFY_PROTOCOL};
pub use types::{
    Denial, FileId, FileKind, FileMeta, Hook, NodeType, Reason, RefEntry, Sha1Digest, WriteCred,
    SHA1_LEN, UNUSED_SRC_ID,
};
