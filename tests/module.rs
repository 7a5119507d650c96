//! Dynamic module loading against a real shared object.
//!
//! The fixture crate under `tests/fixtures/modchan` is built on demand as
//! a cdylib advertising one impl and an init hook. Modules must come from
//! the same toolchain as the host, which holds here because the test
//! builds the fixture itself.

mod common;

use std::path::PathBuf;
use std::process::Command;

use common::*;
use commlink::prelude::*;
use commlink::Registration;

fn build_fixture() -> PathBuf {
    let fixture = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/modchan");
    // A private target dir keeps the build off the parent's cargo lock.
    let target = fixture.join("target");
    let status = Command::new("cargo")
        .args(["build", "--quiet"])
        .arg("--target-dir")
        .arg(&target)
        .current_dir(&fixture)
        .status()
        .unwrap_or_else(|e| panic!("Failed to build module fixture: {e}"));
    assert!(status.success(), "module fixture build failed");
    target.join("debug")
}

#[test]
fn load_registers_module_impls() {
    init_tracing();
    let dir = build_fixture();
    let spec = format!("{}/modchan", dir.display());

    let ctx = Context::new();
    assert!(ctx.lookup("flip").is_none());
    ctx.load(&spec, "commlink_module").unwrap();

    // The advertised impl is registered under its protocol name.
    let imp = ctx.impl_get("flip").expect("flip impl registered");
    assert_eq!(imp.protocol, "flip");
    // The init hook ran: it registered an alias for the stock null impl.
    assert!(matches!(
        ctx.lookup("flip-null"),
        Some(Registration::Alias(_))
    ));

    // Loading the same path again is a no-op. If the idempotency check
    // failed, the re-run init hook would error on the duplicate alias.
    ctx.load(&spec, "commlink_module").unwrap();

    // A channel built from the loaded impl behaves like any other.
    let c = ctx.channel("flip://;name=f").unwrap();
    let accum = Accum::new();
    accum.subscribe(&c, MsgMask::DATA);
    c.open("").unwrap();
    assert_eq!(c.state(), State::Active);
    let mut msg = Message::data(b"abc".as_slice());
    msg.seq = 5;
    c.post(&msg).unwrap();
    let got = accum.take();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].data, b"cba");
    assert_eq!(got[0].seq, 5);
    c.free();

    // The alias from the init hook resolves to a working channel too.
    let n = ctx.channel("flip-null://;name=n").unwrap();
    n.open("").unwrap();
    assert_eq!(n.state(), State::Active);
    n.free();
}

#[test]
fn load_failures_are_reported() {
    let dir = build_fixture();
    let spec = format!("{}/modchan", dir.display());

    let ctx = Context::new();
    assert!(matches!(
        ctx.load(&spec, "no_such_symbol"),
        Err(Error::ModuleLoad { .. })
    ));
    assert!(matches!(
        ctx.load("./missing/dir/nomodule", "commlink_module"),
        Err(Error::ModuleLoad { .. })
    ));
    // Neither failed attempt registered anything.
    assert!(ctx.lookup("flip").is_none());
    assert!(ctx.lookup("flip-null").is_none());
}
