//! External collaborator interfaces.
//!
//! The engine consults three narrow seams owned by the host platform:
//! - [`CredentialService`] — source-origin definition and authorization,
//!   credential possession, and the administrative/tcb capabilities that
//!   gate the configuration surface.
//! - [`Platform`] — development-certificate presence, which decides whether
//!   bootstrap failures fail open (development) or closed (secure device).
//! - [`HelperInvoker`] — blocking invocation of the userspace helper that
//!   populates reference hashlists.
//!
//! [`StaticCreds`], [`FixedPlatform`], [`ExecHelper`], and [`FnHelper`] are
//! the in-crate implementations used by the CLI and the test suite; real
//! hosts supply their own.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use crate::types::WriteCred;

/// Context describing the process that triggered an enforcement event.
///
/// The engine itself only reads `process` (for logs and notifications) and
/// `in_execve` (to suppress redundant data-open checks); everything else is
/// interpreted by the [`CredentialService`].
#[derive(Debug, Clone, Default)]
pub struct Invoker {
    /// Short process name, as it appears in notifications.
    pub process: String,
    /// True while the process is in the middle of an execve; the exec hook
    /// already covers the file, so data-open checks are skipped.
    pub in_execve: bool,
    /// Credential pairs the process holds.
    pub creds: Vec<WriteCred>,
    /// Whether the process holds the administrative capability.
    pub admin: bool,
    /// Whether the process holds the "tcb" resource token.
    pub tcb: bool,
}

impl Invoker {
    pub fn named(process: &str) -> Self {
        Self {
            process: process.to_string(),
            ..Self::default()
        }
    }
}

/// Source-origin and credential queries, answered by the host policy
/// framework.
pub trait CredentialService: Send + Sync {
    /// Translate a source identifier string into its numeric label,
    /// defining it if necessary. Returns a value `> 0` on success.
    fn define_source(&self, name: &str) -> i64;

    /// May `invoker` load content labeled with `src_id`?
    fn may_load(&self, src_id: i64, invoker: &Invoker) -> bool;

    /// Does `invoker` currently hold the credential pair?
    fn has_credential(&self, invoker: &Invoker, cred: WriteCred) -> bool;

    /// Does `invoker` hold the administrative capability that guards the
    /// configuration surface before sealing?
    fn has_admin(&self, invoker: &Invoker) -> bool;

    /// Does `invoker` hold the "tcb" resource token required after sealing?
    fn has_tcb(&self, invoker: &Invoker) -> bool;
}

/// Device-security facts the engine cannot derive itself.
pub trait Platform: Send + Sync {
    /// True on development builds or devices carrying a development
    /// certificate. Controls the bootstrap fail-open/fail-closed split.
    fn has_dev_certificate(&self) -> bool;
}

/// Blocking invocation of a userspace helper program.
pub trait HelperInvoker: Send + Sync {
    /// Run `path` with `args` and `env`, wait for it to exit, and return
    /// its exit code.
    fn run(&self, path: &Path, args: &[String], env: &[(String, String)]) -> io::Result<i32>;
}

// ── In-crate implementations ─────────────────────────────────────────────────

/// Table-driven [`CredentialService`] for tests and the CLI.
///
/// Source identifiers are assigned sequentially per distinct name. Loads
/// are permitted unless the source was explicitly denied. Credential,
/// admin, and tcb possession come straight from the [`Invoker`] fields.
pub struct StaticCreds {
    sources: Mutex<HashMap<String, i64>>,
    next_id: Mutex<i64>,
    denied: Mutex<HashSet<i64>>,
}

impl Default for StaticCreds {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticCreds {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            // 0 and -1 are reserved; hand out labels from 1000 up so tests
            // never collide with them.
            next_id: Mutex::new(1000),
            denied: Mutex::new(HashSet::new()),
        }
    }

    /// Refuse all future `may_load` queries for `src_id`.
    pub fn deny_source(&self, src_id: i64) {
        self.denied.lock().expect("StaticCreds mutex poisoned").insert(src_id);
    }
}

impl CredentialService for StaticCreds {
    fn define_source(&self, name: &str) -> i64 {
        let name = name.trim_start();
        let mut sources = self.sources.lock().expect("StaticCreds mutex poisoned");
        if let Some(&id) = sources.get(name) {
            return id;
        }
        let mut next = self.next_id.lock().expect("StaticCreds mutex poisoned");
        let id = *next;
        *next += 1;
        sources.insert(name.to_string(), id);
        id
    }

    fn may_load(&self, src_id: i64, _invoker: &Invoker) -> bool {
        !self
            .denied
            .lock()
            .expect("StaticCreds mutex poisoned")
            .contains(&src_id)
    }

    fn has_credential(&self, invoker: &Invoker, cred: WriteCred) -> bool {
        invoker.creds.contains(&cred)
    }

    fn has_admin(&self, invoker: &Invoker) -> bool {
        invoker.admin
    }

    fn has_tcb(&self, invoker: &Invoker) -> bool {
        invoker.tcb
    }
}

/// [`Platform`] with a fixed development-certificate answer.
pub struct FixedPlatform(pub bool);

impl Platform for FixedPlatform {
    fn has_dev_certificate(&self) -> bool {
        self.0
    }
}

/// [`HelperInvoker`] that spawns a real process with a minimal environment.
pub struct ExecHelper;

impl HelperInvoker for ExecHelper {
    fn run(&self, path: &Path, args: &[String], env: &[(String, String)]) -> io::Result<i32> {
        let status = Command::new(path)
            .args(args)
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .status()?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// [`HelperInvoker`] backed by a closure, for tests. The closure receives
/// the helper path and arguments and returns the exit code.
pub struct FnHelper<F>(pub F)
where
    F: Fn(&Path, &[String]) -> i32 + Send + Sync;

impl<F> HelperInvoker for FnHelper<F>
where
    F: Fn(&Path, &[String]) -> i32 + Send + Sync,
{
    fn run(&self, path: &Path, args: &[String], _env: &[(String, String)]) -> io::Result<i32> {
        Ok((self.0)(path, args))
    }
}
