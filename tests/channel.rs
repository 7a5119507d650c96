//! Life-cycle, registry and stacking integration tests.
//!
//! Run with `TEST_LOG=2 cargo test --test channel -- --nocapture` to see
//! the tracing output.

mod common;

use std::time::Duration;

use common::*;
use commlink::channel::{NULL_IMPL, PREFIX_IMPL};
use commlink::prelude::*;
use commlink::Url;

// Advances a channel one step; for proxy channels (prefix) the child does
// the actual work.
fn advance(c: &Channel) -> Result<(), Error> {
    let target = c.children().into_iter().next().unwrap_or_else(|| c.clone());
    target.process(Duration::ZERO)
}

// The shared walk-through: construct, open, drive to Active, check the
// published config, post and observe the echo, close and drive to Closed.
fn check_channel(ctx: &Context, url: &str, imp: &'static Impl, eurl: &str) {
    let c = ctx.channel(url).unwrap();
    assert!(Impl::same(c.channel_impl(), imp));
    assert_eq!(c.state(), State::Closed);

    c.open("").unwrap();
    assert_eq!(c.state(), State::Opening);
    advance(&c).unwrap();
    assert_eq!(c.state(), State::Active);
    assert!(advance(&c).unwrap_err().is_again());

    let cfg = c.config();
    assert_eq!(cfg.get("state").as_deref(), Some("Active"));
    let persisted = Url::from_config(&cfg.sub("url").unwrap()).unwrap();
    assert_eq!(persisted.to_string(), eurl);

    let accum = Accum::new();
    accum.subscribe(&c, MsgMask::DATA);
    let mut msg = Message::data(b"ping".as_slice());
    msg.seq = 100;
    c.post(&msg).unwrap();
    let got = accum.take();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].seq, 100);
    assert_eq!(got[0].data, b"ping");

    c.close().unwrap();
    assert_eq!(c.state(), State::Closing);
    let _ = advance(&c);
    assert_eq!(c.state(), State::Closed);
    c.free();
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn register_and_unregister() {
    init_tracing();
    let ctx = Context::new();

    assert!(ctx.channel("echo://;name=echo").is_err());
    ctx.register(&ECHO_IMPL).unwrap();
    assert!(matches!(
        ctx.register(&ECHO_IMPL),
        Err(Error::Duplicate { kind: "impl", .. })
    ));

    // Same impl under a second name works and resolves independently.
    assert!(ctx.channel("echo2://;name=e2").is_err());
    ctx.register_as(&ECHO_IMPL, "echo2").unwrap();
    let c = ctx.channel("echo2://;name=e2").unwrap();
    assert!(Impl::same(c.channel_impl(), &ECHO_IMPL));
    c.free();

    ctx.unregister_as(&ECHO_IMPL, "echo2").unwrap();
    assert!(ctx.channel("echo2://;name=e2").is_err());

    ctx.unregister(&ECHO_IMPL).unwrap();
    assert!(matches!(
        ctx.unregister(&ECHO_IMPL),
        Err(Error::NotFound { kind: "impl", .. })
    ));
}

#[test]
fn unregister_checks_entry_kind() {
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    ctx.alias_register("eko", "echo://").unwrap();

    // An alias can not be unregistered as an impl, and vice versa.
    assert!(matches!(
        ctx.unregister_as(&ECHO_IMPL, "eko"),
        Err(Error::TypeMismatch { .. })
    ));
    assert!(matches!(
        ctx.alias_unregister("echo", "echo://"),
        Err(Error::TypeMismatch { .. })
    ));
    // Wrong impl pointer is rejected.
    assert!(matches!(
        ctx.unregister_as(&NULL_IMPL, "echo"),
        Err(Error::ImplMismatch { .. })
    ));
    // Wrong alias protocol is rejected.
    assert!(matches!(
        ctx.alias_unregister("eko", "null://"),
        Err(Error::TypeMismatch { .. })
    ));
    ctx.alias_unregister("eko", "echo://").unwrap();
}

#[test]
fn duplicate_channel_name_rejected() {
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    let first = ctx.channel("echo://;name=dup").unwrap();
    assert!(matches!(
        ctx.channel("echo://;name=dup"),
        Err(Error::Duplicate { kind: "channel", .. })
    ));
    assert_eq!(ctx.get("dup").unwrap(), first);
    first.free();
    assert!(ctx.get("dup").is_none());
    // The name is reusable once the holder is gone.
    let second = ctx.channel("echo://;name=dup").unwrap();
    second.free();
}

#[test]
fn internal_channels_stay_unindexed() {
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    let c = ctx.channel("echo://;name=ghost;tll.internal=yes").unwrap();
    assert!(c.caps().contains(Caps::CUSTOM));
    assert!(ctx.get("ghost").is_none());
    assert!(ctx.config().sub("ghost").is_none());
    c.free();
}

// ============================================================================
// Scenario 1: Echo
// ============================================================================

#[test]
fn echo_lifecycle() {
    init_tracing();
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    check_channel(&ctx, "echo://;name=echo", &ECHO_IMPL, "echo://;name=echo");
}

#[test]
fn state_transitions_emit_messages() {
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    let c = ctx.channel("echo://;name=st").unwrap();
    let accum = Accum::new();
    accum.subscribe(&c, MsgMask::STATE);

    c.open("").unwrap();
    advance(&c).unwrap();
    c.close().unwrap();
    advance(&c).unwrap();

    let states: Vec<State> = accum
        .take()
        .iter()
        .map(|m| State::from_msgid(m.msgid).unwrap())
        .collect();
    assert_eq!(
        states,
        [State::Opening, State::Active, State::Closing, State::Closed]
    );
    c.free();
}

// ============================================================================
// Scenario 2: Aliases
// ============================================================================

#[test]
fn alias_validation() {
    let ctx = Context::new();

    // "direct" is a stock impl, so the name collides; an unknown target
    // protocol does not resolve.
    assert!(matches!(
        ctx.alias_register("alias", "echo://"),
        Err(Error::Unresolvable { .. })
    ));
    ctx.register(&ECHO_IMPL).unwrap();
    assert!(matches!(
        ctx.alias_register("direct", "echo://"),
        Err(Error::Duplicate { .. })
    ));
    assert!(matches!(
        ctx.alias_register("alias", "echo://somehost"),
        Err(Error::AliasInvalid { .. })
    ));
    assert!(matches!(
        ctx.alias_register("alias", "echo://;name=fixed"),
        Err(Error::AliasInvalid { .. })
    ));

    ctx.alias_register("alias", "echo://").unwrap();
    assert!(matches!(
        ctx.alias_register("alias", "echo://"),
        Err(Error::Duplicate { .. })
    ));
}

#[test]
fn alias_resolves_to_impl() {
    init_tracing();
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    ctx.alias_register("alias", "echo://").unwrap();
    // The persisted URL is the rewritten one.
    check_channel(&ctx, "alias://;name=a", &ECHO_IMPL, "echo://;name=a");
}

#[test]
fn alias_prefix_splices_suffix() {
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    ctx.register(&PREFIX_IMPL).unwrap();
    ctx.alias_register("alias+", "prefix+://").unwrap();
    ctx.alias_register("other", "echo://").unwrap();
    check_channel(
        &ctx,
        "alias+other://;name=echo",
        &PREFIX_IMPL,
        "prefix+other://;name=echo",
    );
}

#[test]
fn alias_chains_resolve_transitively() {
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    ctx.register(&PREFIX_IMPL).unwrap();
    ctx.alias_register("other+", "prefix+://").unwrap();
    ctx.alias_register("alias", "other+echo://").unwrap();
    check_channel(
        &ctx,
        "alias://;name=echo",
        &PREFIX_IMPL,
        "prefix+echo://;name=echo",
    );
}

#[test]
fn alias_parameters_merge_into_url() {
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    ctx.alias_register("alias", "echo://;null=yes").unwrap();

    let c = ctx.channel("alias://;name=alias").unwrap();
    // Merged null=yes steered init to the null impl, and the persisted
    // URL keeps both the rewritten protocol and the merged parameter.
    assert!(Impl::same(c.channel_impl(), &NULL_IMPL));
    let persisted = Url::from_config(&c.config().sub("url").unwrap()).unwrap();
    assert_eq!(persisted.to_string(), "echo://;name=alias;null=yes");
    c.free();

    // A parameter defined on both sides is a conflict.
    let err = ctx.channel("alias://;name=b;null=no").unwrap_err();
    assert!(matches!(err, Error::DuplicateField { .. }));
}

#[test]
fn alias_cycle_detected() {
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    ctx.alias_register("b", "echo://").unwrap();
    ctx.alias_register("a", "b://").unwrap();
    // Re-pointing b at a closes the loop; each registration step is
    // individually valid, so construction must detect the cycle instead
    // of spinning.
    ctx.alias_unregister("b", "echo://").unwrap();
    ctx.alias_register("b", "a://").unwrap();
    assert!(matches!(
        ctx.channel("a://;name=x"),
        Err(Error::AliasLoop { .. })
    ));
    assert!(matches!(
        ctx.channel("b://;name=x"),
        Err(Error::AliasLoop { .. })
    ));
}

// ============================================================================
// Scenario 3: Init-Replace
// ============================================================================

#[test]
fn init_replace_switches_impl() {
    init_tracing();
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();

    let c = ctx.channel("echo://;name=echo-null;null=yes").unwrap();
    assert!(Impl::same(c.channel_impl(), &NULL_IMPL));

    assert_eq!(c.state(), State::Closed);
    c.open("").unwrap();
    // Null opens straight to Active and never has work.
    assert_eq!(c.state(), State::Active);
    assert!(c.process(Duration::ZERO).unwrap_err().is_again());
    c.free();
}

#[derive(Default)]
struct Fickle;

impl ChannelImpl for Fickle {
    fn init(
        &mut self,
        _base: &Base,
        _url: &Url,
        _master: Option<&Channel>,
    ) -> Result<InitAction, Error> {
        Ok(InitAction::Replace(&FICKLE_IMPL))
    }

    fn post(&mut self, _base: &Base, _msg: &Message) -> Result<(), Error> {
        Ok(())
    }
}

static FICKLE_IMPL: Impl = Impl {
    protocol: "fickle",
    new: || Box::new(Fickle),
};

#[test]
fn init_replace_cycle_detected() {
    let ctx = Context::new();
    ctx.register(&FICKLE_IMPL).unwrap();
    assert!(matches!(
        ctx.channel("fickle://;name=f"),
        Err(Error::InitLoop { .. })
    ));
}

// ============================================================================
// Scenario 4: Prefix Stacking
// ============================================================================

#[test]
fn prefix_wraps_inner_channel() {
    init_tracing();
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    ctx.register(&PREFIX_IMPL).unwrap();
    check_channel(
        &ctx,
        "prefix+echo://;name=echo",
        &PREFIX_IMPL,
        "prefix+echo://;name=echo",
    );
}

#[test]
fn prefix_child_naming_and_caps() {
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    ctx.register(&PREFIX_IMPL).unwrap();

    let c = ctx.channel("prefix+echo://;name=outer").unwrap();
    assert!(c.caps().contains(Caps::PROXY));
    let children = c.children();
    assert_eq!(children.len(), 1);
    let inner = &children[0];
    assert_eq!(inner.name(), "outer/prefix");
    assert!(inner.caps().contains(Caps::CUSTOM));
    assert!(ctx.get("outer/prefix").is_none());
    assert!(ctx.get("outer").is_some());
    c.free();
}

// ============================================================================
// Callback Plane
// ============================================================================

#[test]
fn callback_masks_or_merge() {
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    let c = ctx.channel("echo://;name=cb").unwrap();

    let accum = Accum::new();
    // Adding the same pair twice merges masks into one entry.
    accum.subscribe(&c, MsgMask::DATA);
    accum.subscribe(&c, MsgMask::STATE);

    c.open("").unwrap();
    advance(&c).unwrap();
    let mut msg = Message::data(b"x".as_slice());
    msg.seq = 7;
    c.post(&msg).unwrap();

    let got = accum.take();
    let states: Vec<i32> = got
        .iter()
        .filter(|m| m.msg_type == MsgType::State)
        .map(|m| m.msgid)
        .collect();
    let data: Vec<i64> = got
        .iter()
        .filter(|m| m.msg_type == MsgType::Data)
        .map(|m| m.seq)
        .collect();
    assert_eq!(states, [State::Opening as i32, State::Active as i32]);
    assert_eq!(data, [7]);

    // Dropping only the DATA bit keeps the STATE subscription.
    c.callback_del(accum.callback(), MsgMask::DATA).unwrap();
    c.post(&msg).unwrap();
    c.close().unwrap();
    let got = accum.take();
    assert!(got.iter().all(|m| m.msg_type == MsgType::State));
    assert!(!got.is_empty());

    // Unknown pair is reported.
    let stranger = Callback::new(|_, _| 0);
    assert!(matches!(
        c.callback_del(&stranger, MsgMask::ALL),
        Err(Error::NotFound { .. })
    ));
    c.free();
}

#[test]
fn callback_removal_during_fanout() {
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    let c = ctx.channel("echo://;name=reent").unwrap();
    c.open("").unwrap();
    advance(&c).unwrap();

    // The first callback removes itself on delivery; the second must
    // still be invoked in the same fan-out.
    let accum = Accum::new();
    let sub = c.clone();
    let self_removing = Callback::new(move |_c: &Channel, _m: &Message| {
        0
    });
    let remover = self_removing.clone();
    let once = Callback::new(move |c: &Channel, _m: &Message| {
        let _ = c.callback_del(&remover, MsgMask::DATA);
        0
    });
    c.callback_add(&once, MsgMask::DATA).unwrap();
    c.callback_add(&self_removing, MsgMask::DATA).unwrap();
    accum.subscribe(&c, MsgMask::DATA);

    c.post(&Message::data(b"a".as_slice())).unwrap();
    assert_eq!(accum.len(), 1);
    // The removed pair really is gone.
    assert!(matches!(
        sub.callback_del(&self_removing, MsgMask::DATA),
        Err(Error::NotFound { .. })
    ));
    c.free();
}

// ============================================================================
// Suspension
// ============================================================================

#[test]
fn suspend_propagates_to_descendants() {
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    ctx.register(&PREFIX_IMPL).unwrap();
    let c = ctx.channel("prefix+echo://;name=sus").unwrap();
    let inner = c.children().remove(0);

    c.open("").unwrap();
    inner.process(Duration::ZERO).unwrap();
    assert_eq!(c.state(), State::Active);

    c.suspend();
    assert!(c.dcaps().contains(DCaps::SUSPEND | DCaps::SUSPEND_PERMANENT));
    assert!(inner.dcaps().contains(DCaps::SUSPEND));
    assert!(!inner.dcaps().contains(DCaps::SUSPEND_PERMANENT));
    // A suspended channel is not processed.
    assert!(inner.process(Duration::ZERO).unwrap_err().is_again());

    c.resume();
    assert!(!c.dcaps().contains(DCaps::SUSPEND));
    assert!(!inner.dcaps().contains(DCaps::SUSPEND));

    // A child's own permanent suspension survives a parent resume cycle.
    inner.suspend();
    c.suspend();
    c.resume();
    assert!(inner.dcaps().contains(DCaps::SUSPEND));
    inner.resume();
    assert!(!inner.dcaps().contains(DCaps::SUSPEND));
    c.free();
}

// ============================================================================
// Direct Pair and Masters
// ============================================================================

#[test]
fn direct_pair_crossposts() {
    let ctx = Context::new();
    let master = ctx.channel("direct://;name=dm").unwrap();
    let slave = ctx.channel("direct://;name=ds;master=dm").unwrap();
    master.open("").unwrap();
    slave.open("").unwrap();

    let on_master = Accum::new();
    let on_slave = Accum::new();
    on_master.subscribe(&master, MsgMask::DATA);
    on_slave.subscribe(&slave, MsgMask::DATA);

    let mut msg = Message::data(b"down".as_slice());
    msg.seq = 1;
    master.post(&msg).unwrap();
    assert_eq!(on_slave.take().len(), 1);
    assert_eq!(on_master.len(), 0);

    msg.seq = 2;
    slave.post(&msg).unwrap();
    let up = on_master.take();
    assert_eq!(up.len(), 1);
    assert_eq!(up[0].seq, 2);

    slave.free();
    master.free();
}

#[test]
fn master_resolution_failures() {
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    assert!(matches!(
        ctx.channel("direct://;name=d;master=nope"),
        Err(Error::NotFound { kind: "master", .. })
    ));
    // A master of the wrong kind is refused by the impl.
    let e = ctx.channel("echo://;name=em").unwrap();
    assert!(ctx.channel("direct://;name=d;master=em").is_err());
    e.free();
}

// ============================================================================
// Error State Handling
// ============================================================================

#[derive(Default)]
struct FailOpen;

impl ChannelImpl for FailOpen {
    fn open(&mut self, _base: &Base, _params: &Url) -> Result<(), Error> {
        Err(Error::invalid_arg("always fails"))
    }

    fn post(&mut self, _base: &Base, _msg: &Message) -> Result<(), Error> {
        Ok(())
    }
}

static FAIL_OPEN_IMPL: Impl = Impl {
    protocol: "failopen",
    new: || Box::new(FailOpen),
};

#[test]
fn open_failure_is_observable_and_resettable() {
    let ctx = Context::new();
    ctx.register(&FAIL_OPEN_IMPL).unwrap();
    let c = ctx.channel("failopen://;name=f").unwrap();
    let accum = Accum::new();
    accum.subscribe(&c, MsgMask::STATE);

    assert!(matches!(c.open(""), Err(Error::OpenFailed { .. })));
    assert_eq!(c.state(), State::Error);
    assert_eq!(c.config().get("state").as_deref(), Some("Error"));
    let states: Vec<i32> = accum.take().iter().map(|m| m.msgid).collect();
    assert_eq!(states, [State::Opening as i32, State::Error as i32]);

    // Opening again implicitly resets through Closed first.
    assert!(c.open("").is_err());
    let states: Vec<i32> = accum.take().iter().map(|m| m.msgid).collect();
    assert_eq!(
        states,
        [
            State::Closed as i32,
            State::Opening as i32,
            State::Error as i32
        ]
    );
    c.free();
}

// ============================================================================
// Stats and Schemes
// ============================================================================

#[test]
fn stat_counters_track_traffic() {
    let ctx = Context::new();
    ctx.register(&ECHO_IMPL).unwrap();
    let c = ctx.channel("echo://;name=counted;stat=yes").unwrap();
    c.open("").unwrap();
    advance(&c).unwrap();

    c.post(&Message::data(b"12345".as_slice())).unwrap();
    let stats = ctx.stat_list().iter();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].name(), "counted");
    let (rx, rxb, tx, txb) = stats[0].snapshot();
    // The echo loops the post back: one message out, one in.
    assert_eq!((rx, rxb, tx, txb), (1, 5, 1, 5));

    c.free();
    assert!(ctx.stat_list().iter().is_empty());
}

#[test]
fn scheme_cache_returns_shared_instances() {
    let ctx = Context::new();
    let a = ctx.scheme_load("yamls://- name: msg", true).unwrap();
    let b = ctx.scheme_load("yamls://- name: msg", true).unwrap();
    assert!(std::sync::Arc::ptr_eq(&a, &b));
    let c = ctx.scheme_load("yamls://- name: msg", false).unwrap();
    assert!(!std::sync::Arc::ptr_eq(&a, &c));
    assert!(matches!(
        ctx.scheme_load("channel://missing", true),
        Err(Error::NotFound { .. })
    ));
}
