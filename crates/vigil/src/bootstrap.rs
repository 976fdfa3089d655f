//! Bootstrap loader: populating reference hashlists via the userspace
//! helper.
//!
//! Reference hashes live in userspace images, so the very first
//! verification on a volume has a chicken-and-egg problem: the helper that
//! writes the hashes is itself an executable the engine wants to verify.
//! Three fast paths admit it before the root hashlist exists:
//!
//! 1. the file is already in the verification cache,
//! 2. its digest matches the `vhash` digest installed from the kernel
//!    command line, or
//! 3. a development certificate is present and the file sits at the
//!    configured helper path.
//!
//! A successful helper run latches `hashlist_ready`. A failed run disables
//! the whole engine when a development certificate is present; on a secure
//! device it panics — running without reference hashes is not an option.
//!
//! Helper invocations are serialized by one global lock; hashes for
//! volumes other than the root are requested with the volume's mount point
//! as the helper's argument.

use log::info;

use crate::creds::Invoker;
use crate::digest::verify_refhash;
use crate::engine::{OpenFile, Validator};
use crate::types::FileId;

/// Outcome of the pre-verification bootstrap step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BootstrapCheck {
    /// The root hashlist is available; continue with normal verification.
    Proceed,
    /// The file was recognized as the bootstrap helper; admit it without
    /// further checks so it can load the hashes.
    HelperAdmitted,
}

impl Validator {
    /// Run the userspace helper for `path_arg`, serialized with every
    /// other invocation. Latches readiness on the first success; on the
    /// first failure, fails open (engine disabled) with a development
    /// certificate and closed (panic) without one.
    pub(crate) fn run_init_helper(&self, path_arg: &str) -> Result<(), ()> {
        let _guard = self.helper_lock.lock().expect("helper lock poisoned");
        if path_arg == "/" && self.config.hashlist_ready() {
            // Another thread finished the root load while we waited.
            return Ok(());
        }
        info!("invoking userspace helper for {path_arg}");
        let env = [
            ("HOME".to_string(), "/".to_string()),
            (
                "PATH".to_string(),
                "/sbin:/bin:/usr/sbin:/usr/bin".to_string(),
            ),
        ];
        let code = self
            .helper
            .run(&self.helper_path, &[path_arg.to_string()], &env)
            .unwrap_or(-1);
        if code == 0 {
            if !self.config.hashlist_ready() {
                info!("enabled (config data protection)");
                self.config.set_hashlist_ready();
            }
            Ok(())
        } else {
            if !self.config.hashlist_ready() && self.platform.has_dev_certificate() {
                info!("disabled (helper exit {code})");
                self.config.disable_engine();
            }
            Err(())
        }
    }

    /// Pre-verification step of the executable path: make sure the root
    /// hashlist exists, or recognize the helper itself.
    pub(crate) fn initialize_root_hashlist(
        &self,
        file: &OpenFile,
        _invoker: &Invoker,
    ) -> Result<BootstrapCheck, ()> {
        if self.config.hashlist_ready() {
            return Ok(BootstrapCheck::Proceed);
        }
        if self.cache.lookup(file.id).is_some() {
            return Ok(BootstrapCheck::Proceed);
        }
        // Keep writers away while we measure the candidate helper.
        let defended_here = self.deny_write_access(file).map_err(|_| ())?;
        let outcome = self.root_fast_paths_and_load(file.id);
        if defended_here {
            self.allow_write_access(file);
        }
        outcome
    }

    fn root_fast_paths_and_load(&self, id: FileId) -> Result<BootstrapCheck, ()> {
        if let Some(vhash) = &self.vhash {
            if verify_refhash(self.fs.as_ref(), id, vhash).is_ok() {
                info!("vhash code matched {}", self.fs.name_of(id));
                self.cache.insert(id, 0);
                return Ok(BootstrapCheck::HelperAdmitted);
            }
        }
        if self.platform.has_dev_certificate()
            && self.fs.path_of(id).as_deref() == Some(self.helper_path.as_path())
        {
            info!("development certificate found, admitting helper by path");
            self.cache.insert(id, 0);
            return Ok(BootstrapCheck::HelperAdmitted);
        }
        match self.run_init_helper("/") {
            Ok(()) => {
                info!("root hashlist initialized");
                Ok(BootstrapCheck::Proceed)
            }
            Err(()) => {
                if self.config.engine_enabled() {
                    // No development certificate: nothing may run without
                    // reference hashes.
                    panic!("bootstrap helper failed on a secure device");
                }
                info!("hashlist init failed (ignored)");
                Err(())
            }
        }
    }

    /// Ask the helper for the hashes of the volume holding `id`, used when
    /// a lookup misses on an already-bootstrapped system. A no-op unless
    /// try-load is enabled.
    pub(crate) fn load_volume_hashes(&self, id: FileId) -> Result<(), ()> {
        if !self.config.try_load_enabled() {
            return Ok(());
        }
        let mount = self.fs.mount_point(id.dev).ok_or(())?;
        self.run_init_helper(&mount.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnableFlags, EnforceFlags};
    use crate::creds::{FixedPlatform, FnHelper, StaticCreds};
    use crate::digest::digest_buffer;
    use crate::engine::Options;
    use crate::fs::MemFs;
    use crate::hashlist::Volumes;
    use crate::types::{Hook, NodeType, RefEntry};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn engine_with_helper<F>(
        fs: Arc<MemFs>,
        dev_cert: bool,
        vhash: Option<crate::types::Sha1Digest>,
        helper: F,
    ) -> Validator
    where
        F: Fn(&Path, &[String]) -> i32 + Send + Sync + 'static,
    {
        Validator::new(
            Options {
                vhash,
                enable: EnableFlags::HASH_CHECK | EnableFlags::TRY_LOAD,
                enforce: EnforceFlags::HASH_CHECK,
                ..Options::default()
            },
            fs,
            Arc::new(StaticCreds::new()),
            Arc::new(FixedPlatform(dev_cert)),
            Arc::new(FnHelper(helper)),
        )
    }

    #[test]
    fn test_vhash_match_admits_helper_and_seeds_cache() {
        let fs = Arc::new(MemFs::new());
        let id = FileId::new(1, 10);
        fs.add_file(id, "/sbin/vigil-init", b"helper binary", 0, 0, 493);
        let engine = engine_with_helper(
            Arc::clone(&fs),
            false,
            Some(digest_buffer(b"helper binary")),
            |_, _| panic!("helper must not run for its own admission"),
        );
        let file = engine.open_file(id);
        assert_eq!(
            engine.initialize_root_hashlist(&file, &Invoker::named("init")),
            Ok(BootstrapCheck::HelperAdmitted)
        );
        assert_eq!(engine.cache().lookup(id), Some(0), "helper cached with src 0");
        assert!(!engine.config().hashlist_ready());
    }

    #[test]
    fn test_dev_certificate_path_match_admits_helper() {
        let fs = Arc::new(MemFs::new());
        let id = FileId::new(1, 10);
        fs.add_file(id, "/sbin/vigil-init", b"helper binary", 0, 0, 493);
        let engine = engine_with_helper(Arc::clone(&fs), true, None, |_, _| {
            panic!("helper must not run for its own admission")
        });
        let file = engine.open_file(id);
        assert_eq!(
            engine.initialize_root_hashlist(&file, &Invoker::named("init")),
            Ok(BootstrapCheck::HelperAdmitted)
        );
    }

    #[test]
    fn test_helper_success_latches_ready_and_loads_entries() {
        let fs = Arc::new(MemFs::new());
        let app = FileId::new(1, 20);
        fs.add_file(app, "/bin/app", b"app content", 0, 0, 493);
        // The helper writes entries into the engine's volume registry, as
        // the real one would through the control surface. The registry
        // handle is filled in after the engine exists.
        let registry: Arc<std::sync::Mutex<Option<Arc<Volumes>>>> =
            Arc::new(std::sync::Mutex::new(None));
        let registry_ref = Arc::clone(&registry);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = Arc::clone(&calls);
        let engine = Validator::new(
            Options {
                enable: EnableFlags::HASH_CHECK,
                enforce: EnforceFlags::HASH_CHECK,
                ..Options::default()
            },
            Arc::clone(&fs) as Arc<dyn crate::fs::Filesystem>,
            Arc::new(StaticCreds::new()),
            Arc::new(FixedPlatform(false)),
            Arc::new(FnHelper(move |path: &Path, args: &[String]| {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                assert_eq!(path, PathBuf::from("/sbin/vigil-init"));
                assert_eq!(args, ["/"]);
                let volumes = registry_ref
                    .lock()
                    .expect("registry slot")
                    .clone()
                    .expect("registry installed before first verification");
                volumes.get_or_create(1).insert(RefEntry {
                    ino: 20,
                    nodetype: NodeType::Executable,
                    uid: 0,
                    gid: 0,
                    mode: 493,
                    src_id: 5,
                    digest: digest_buffer(b"app content"),
                    wcreds: None,
                });
                0
            })),
        );
        *registry.lock().expect("registry slot") = Some(engine.volumes_shared());

        let file = engine.open_file(app);
        assert_eq!(
            engine.initialize_root_hashlist(&file, &Invoker::named("sh")),
            Ok(BootstrapCheck::Proceed)
        );
        assert!(engine.config().hashlist_ready());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(
            engine.volumes().get(1).expect("volume").contains(20),
            "helper-written entry visible to the engine"
        );
        // Subsequent calls short-circuit without another helper run.
        assert_eq!(
            engine.initialize_root_hashlist(&file, &Invoker::named("sh")),
            Ok(BootstrapCheck::Proceed)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_helper_failure_with_dev_cert_disables_engine() {
        let fs = Arc::new(MemFs::new());
        let app = FileId::new(1, 20);
        fs.add_file(app, "/bin/app", b"app content", 0, 0, 493);
        let engine = engine_with_helper(Arc::clone(&fs), true, None, |_, _| 1);
        let file = engine.open_file(app);
        assert_eq!(
            engine.initialize_root_hashlist(&file, &Invoker::named("sh")),
            Err(())
        );
        assert!(!engine.config().engine_enabled(), "fail-open on dev device");
    }

    #[test]
    #[should_panic(expected = "bootstrap helper failed on a secure device")]
    fn test_helper_failure_without_dev_cert_panics() {
        let fs = Arc::new(MemFs::new());
        let app = FileId::new(1, 20);
        fs.add_file(app, "/bin/app", b"app content", 0, 0, 493);
        let engine = engine_with_helper(Arc::clone(&fs), false, None, |_, _| 1);
        let file = engine.open_file(app);
        let _ = engine.initialize_root_hashlist(&file, &Invoker::named("sh"));
    }

    #[test]
    fn test_concurrent_writer_blocks_bootstrap_measurement() {
        let fs = Arc::new(MemFs::new());
        let id = FileId::new(1, 10);
        fs.add_file(id, "/sbin/vigil-init", b"helper binary", 0, 0, 493);
        fs.set_writecount(id, 1);
        let engine = engine_with_helper(
            Arc::clone(&fs),
            false,
            Some(digest_buffer(b"helper binary")),
            |_, _| 0,
        );
        let file = engine.open_file(id);
        assert_eq!(
            engine.initialize_root_hashlist(&file, &Invoker::named("init")),
            Err(()),
            "an open writer must block the helper measurement"
        );
    }

    #[test]
    fn test_load_volume_hashes_uses_mount_point() {
        let fs = Arc::new(MemFs::new());
        fs.add_mount(7, "/mnt/cards");
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let seen_ref = Arc::clone(&seen);
        let engine = engine_with_helper(Arc::clone(&fs), false, None, move |_, args| {
            seen_ref.lock().expect("seen lock").extend(args.iter().cloned());
            0
        });
        engine.config().set_hashlist_ready();
        engine
            .load_volume_hashes(FileId::new(7, 1))
            .expect("volume load");
        assert_eq!(*seen.lock().expect("seen lock"), ["/mnt/cards"]);
    }

    #[test]
    fn test_load_volume_hashes_noop_without_try_load() {
        let fs = Arc::new(MemFs::new());
        let engine = Validator::new(
            Options::default(), // TRY_LOAD not set
            fs,
            Arc::new(StaticCreds::new()),
            Arc::new(FixedPlatform(false)),
            Arc::new(FnHelper(|_: &Path, _: &[String]| {
                panic!("helper must not run with try-load disabled")
            })),
        );
        engine
            .load_volume_hashes(FileId::new(7, 1))
            .expect("silently skipped");
    }

    #[test]
    fn test_exec_denied_while_bootstrap_impossible() {
        // Enforcing engine, no vhash, no dev cert, helper fails on a dev
        // build: after the engine disables itself the check admits.
        let fs = Arc::new(MemFs::new());
        let app = FileId::new(1, 20);
        fs.add_file(app, "/bin/app", b"app content", 0, 0, 493);
        let engine = engine_with_helper(Arc::clone(&fs), true, None, |_, _| 1);
        let file = engine.open_file(app);
        assert_eq!(
            engine.check_executable(&file, Hook::Exec, &Invoker::named("sh")),
            Err(crate::types::Denial::NotPermitted),
            "first check still enforces the failed bootstrap"
        );
        assert!(!engine.config().engine_enabled());
    }
}
