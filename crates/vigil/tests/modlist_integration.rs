//! Module whitelist end-to-end: authorize digests through the control
//! surface, then gate module loads on them.

use std::sync::Arc;

use vigil::{
    digest_buffer, Denial, EnableFlags, EnforceFlags, FixedPlatform, FnHelper, Invoker, MemFs,
    Options, StaticCreds, Validator,
};

fn engine(module_check: bool) -> Validator {
    let mut enable = EnableFlags::HASH_CHECK;
    if module_check {
        enable |= EnableFlags::MODULE_CHECK;
    }
    Validator::new(
        Options {
            enable,
            enforce: EnforceFlags::HASH_CHECK,
            ..Options::default()
        },
        Arc::new(MemFs::new()),
        Arc::new(StaticCreds::new()),
        Arc::new(FixedPlatform(false)),
        Arc::new(FnHelper(|_: &std::path::Path, _: &[String]| 0)),
    )
}

#[test]
fn test_whitelisted_module_loads() {
    let engine = engine(true);
    let module = b"ELF module image bytes".to_vec();
    engine
        .write_modlist(&Invoker::named("root"), &digest_buffer(&module))
        .expect("digest authorized");
    engine.on_module_load(&module).expect("whitelisted module loads");
}

#[test]
fn test_unknown_module_is_denied() {
    let engine = engine(true);
    let module = b"ELF module image bytes".to_vec();
    engine
        .write_modlist(&Invoker::named("root"), &digest_buffer(&module))
        .expect("digest authorized");
    assert_eq!(
        engine.on_module_load(b"some other module"),
        Err(Denial::NotPermitted)
    );
}

#[test]
fn test_module_check_disabled_admits_everything() {
    let engine = engine(false);
    engine
        .on_module_load(b"never authorized")
        .expect("module checking disabled");
}

#[test]
fn test_duplicate_authorization_is_idempotent() {
    let engine = engine(true);
    let module = b"module".to_vec();
    let digest = digest_buffer(&module);
    let root = Invoker::named("root");
    engine.write_modlist(&root, &digest).expect("first write");
    engine.write_modlist(&root, &digest).expect("second write");
    assert_eq!(engine.modlist().len(), 1);
    let dump = engine.read_modlist(&root).expect("dump");
    assert_eq!(
        dump.matches(&{
            let mut hex = String::new();
            for byte in digest {
                hex.push_str(&format!("{byte:02x}"));
            }
            hex
        })
        .count(),
        1,
        "digest listed exactly once"
    );
}
