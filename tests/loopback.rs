//! Single-endpoint scenarios: loopback messaging, cancellation, boundary
//! behaviors and address round trips.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use naos::{Class, NaError, OpInfo};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn unique_name(tag: &str) -> String {
    format!("{tag}-{}", std::process::id())
}

fn progress_until(ctx: &naos::Context, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for completions");
        match ctx.poll_wait(50) {
            Ok(_) => {
                ctx.trigger(u32::MAX).unwrap();
            }
            Err(NaError::Timeout) => {}
            Err(err) => panic!("poll_wait failed: {err}"),
        }
    }
}

#[test]
fn test_version_and_protocol_info() {
    let (major, _, _) = naos::version();
    assert!(major > 0 || naos::version().1 > 0);

    let infos = naos::protocol_info_get(None).unwrap();
    assert!(infos
        .iter()
        .any(|i| i.class_name == "na" && i.protocol_name == "sm" && i.device_name == "shm"));

    let infos = naos::protocol_info_get(Some("tcp://")).unwrap();
    assert!(infos.is_empty());

    assert!(matches!(
        Class::initialize("tcp://", false),
        Err(NaError::ProtoNoSupport)
    ));
}

#[test]
fn test_loopback_unexpected_send_recv() {
    init_logger();
    let class = Class::initialize(&format!("sm://{}", unique_name("s1")), true).unwrap();
    let ctx = class.context_create().unwrap();

    let self_addr = class.addr_self().unwrap();
    assert!(self_addr.is_self());

    let recv_op = class.op_create().unwrap();
    let send_op = class.op_create().unwrap();

    let recv_result = Arc::new(Mutex::new(None));
    let send_ok = Arc::new(AtomicU32::new(0));

    {
        let recv_result = recv_result.clone();
        class
            .msg_recv_unexpected(
                &ctx,
                move |info| {
                    *recv_result.lock().unwrap() = Some(info);
                },
                vec![0u8; 16],
                &recv_op,
            )
            .unwrap();
    }
    {
        let send_ok = send_ok.clone();
        class
            .msg_send_unexpected(
                &ctx,
                move |info| {
                    assert!(info.ret.is_ok());
                    send_ok.fetch_add(1, Ordering::SeqCst);
                },
                b"hello",
                &self_addr,
                0,
                7,
                &send_op,
            )
            .unwrap();
    }

    progress_until(&ctx, || {
        send_ok.load(Ordering::SeqCst) == 1 && recv_result.lock().unwrap().is_some()
    });

    let info = recv_result.lock().unwrap().take().unwrap();
    assert!(info.ret.is_ok());
    match info.info {
        OpInfo::RecvUnexpected {
            buf,
            actual_size,
            source,
            tag,
        } => {
            assert_eq!(actual_size, 5);
            assert_eq!(tag, 7);
            assert_eq!(&buf[..5], b"hello");
            let source = source.unwrap();
            assert!(class.addr_cmp(&source, &self_addr));
            class.addr_free(source);
        }
        other => panic!("unexpected callback info: {other:?}"),
    }

    // Both operations completed exactly once; the ops are reusable now.
    assert!(recv_op.is_completed());
    assert!(send_op.is_completed());

    class.op_destroy(recv_op);
    class.op_destroy(send_op);
    class.addr_free(self_addr);
    class.context_destroy(ctx).map_err(|(_, e)| e).unwrap();
    class.finalize().map_err(|(_, e)| e).unwrap();
}

#[test]
fn test_zero_size_and_overflow_sends() {
    init_logger();
    let class = Class::initialize(&format!("sm://{}", unique_name("bounds")), true).unwrap();
    let ctx = class.context_create().unwrap();
    let self_addr = class.addr_self().unwrap();

    let max = class.msg_size_max_unexpected();
    assert!(max > 0);

    // One over the ceiling fails synchronously with Overflow.
    let op = class.op_create().unwrap();
    let oversized = vec![0u8; max + 1];
    assert!(matches!(
        class.msg_send_unexpected(&ctx, |_| {}, &oversized, &self_addr, 0, 0, &op),
        Err(NaError::Overflow)
    ));

    // A zero-size send succeeds without a copy buffer.
    let recv_op = class.op_create().unwrap();
    let got = Arc::new(Mutex::new(None));
    {
        let got = got.clone();
        class
            .msg_recv_unexpected(
                &ctx,
                move |info| {
                    *got.lock().unwrap() = Some(info);
                },
                vec![0u8; 16],
                &recv_op,
            )
            .unwrap();
    }
    class
        .msg_send_unexpected(&ctx, |info| assert!(info.ret.is_ok()), &[], &self_addr, 0, 3, &op)
        .unwrap();

    progress_until(&ctx, || got.lock().unwrap().is_some());
    let info = got.lock().unwrap().take().unwrap();
    match info.info {
        OpInfo::RecvUnexpected {
            actual_size,
            tag,
            source,
            ..
        } => {
            assert_eq!(actual_size, 0);
            assert_eq!(tag, 3);
            drop(source);
        }
        other => panic!("unexpected callback info: {other:?}"),
    }

    class.op_destroy(op);
    class.op_destroy(recv_op);
    class.addr_free(self_addr);
    class.context_destroy(ctx).map_err(|(_, e)| e).unwrap();
    class.finalize().map_err(|(_, e)| e).unwrap();
}

#[test]
fn test_op_reuse_while_pending_is_busy() {
    init_logger();
    let class = Class::initialize(&format!("sm://{}", unique_name("busy")), true).unwrap();
    let ctx = class.context_create().unwrap();

    let op = class.op_create().unwrap();
    class
        .msg_recv_unexpected(&ctx, |_| {}, vec![0u8; 8], &op)
        .unwrap();
    assert!(!op.is_completed());

    // Reusing a pending op must fail Busy without invoking any callback.
    assert!(matches!(
        class.msg_recv_unexpected(&ctx, |_| {}, vec![0u8; 8], &op),
        Err(NaError::Busy)
    ));

    // First submission is still live; cancel it to drain.
    ctx.cancel(&op).unwrap();
    progress_until(&ctx, || op.is_completed() && ctx.completion_count() == 0);

    class.op_destroy(op);
    class.context_destroy(ctx).map_err(|(_, e)| e).unwrap();
    class.finalize().map_err(|(_, e)| e).unwrap();
}

#[test]
fn test_cancel_posted_recv() {
    init_logger();
    let class = Class::initialize(&format!("sm://{}", unique_name("s4")), true).unwrap();
    let ctx = class.context_create().unwrap();

    let op = class.op_create().unwrap();
    let results = Arc::new(Mutex::new(Vec::new()));
    {
        let results = results.clone();
        class
            .msg_recv_unexpected(
                &ctx,
                move |info| results.lock().unwrap().push(info.ret),
                vec![0u8; 32],
                &op,
            )
            .unwrap();
    }

    ctx.cancel(&op).unwrap();
    // Canceling again is a no-op.
    ctx.cancel(&op).unwrap();

    progress_until(&ctx, || !results.lock().unwrap().is_empty());
    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(NaError::Canceled)));
    assert!(op.is_completed());

    // Canceling a completed op stays idempotent.
    ctx.cancel(&op).unwrap();

    class.op_destroy(op);
    class.context_destroy(ctx).map_err(|(_, e)| e).unwrap();
    class.finalize().map_err(|(_, e)| e).unwrap();
}

#[test]
fn test_completion_count_matches_trigger() {
    init_logger();
    let class = Class::initialize(&format!("sm://{}", unique_name("count")), true).unwrap();
    let ctx = class.context_create().unwrap();
    let self_addr = class.addr_self().unwrap();

    const N: usize = 8;
    let fired = Arc::new(AtomicU32::new(0));
    let mut ops = Vec::new();
    for i in 0..N {
        let op = class.op_create().unwrap();
        let fired = fired.clone();
        class
            .msg_send_unexpected(
                &ctx,
                move |info| {
                    assert!(info.ret.is_ok());
                    fired.fetch_add(1, Ordering::SeqCst);
                },
                &[i as u8],
                &self_addr,
                0,
                i as u32,
                &op,
            )
            .unwrap();
        ops.push(op);
    }

    // Sends complete inline: the queued count equals the number of
    // callbacks the next trigger will run.
    assert_eq!(ctx.completion_count(), N as u32);
    let ran = ctx.trigger(u32::MAX).unwrap();
    assert_eq!(ran, N as u32);
    assert_eq!(fired.load(Ordering::SeqCst), N as u32);
    assert_eq!(ctx.completion_count(), 0);

    // Drain the cached unexpected messages before closing.
    for op in &ops {
        class
            .msg_recv_unexpected(&ctx, |_| {}, vec![0u8; 16], op)
            .unwrap();
    }
    progress_until(&ctx, || ctx.completion_count() == 0 && ops.iter().all(|o| o.is_completed()));

    for op in ops {
        class.op_destroy(op);
    }
    class.addr_free(self_addr);
    class.context_destroy(ctx).map_err(|(_, e)| e).unwrap();
    class.finalize().map_err(|(_, e)| e).unwrap();
}

#[test]
fn test_poll_wait_zero_timeout() {
    init_logger();
    let class = Class::initialize(&format!("sm://{}", unique_name("zeroto")), true).unwrap();
    let ctx = class.context_create().unwrap();

    // Nothing pending: an immediate Timeout.
    assert!(matches!(ctx.poll_wait(0), Err(NaError::Timeout)));
    assert!(matches!(ctx.poll(), Ok(0)));

    class.context_destroy(ctx).map_err(|(_, e)| e).unwrap();
    class.finalize().map_err(|(_, e)| e).unwrap();
}

#[test]
fn test_addr_roundtrip_laws() {
    init_logger();
    let class = Class::initialize(&format!("sm://{}", unique_name("addr")), true).unwrap();

    let self_addr = class.addr_self().unwrap();
    let dup = class.addr_dup(&self_addr);
    assert!(class.addr_cmp(&self_addr, &dup));

    let s = class.addr_to_string(&self_addr).unwrap();
    assert!(s.starts_with("na+sm://"), "unexpected addr string {s}");

    let bytes = class.addr_serialize(&self_addr).unwrap();
    let copy = class.addr_deserialize(&bytes).unwrap();
    assert!(class.addr_cmp(&self_addr, &copy));

    // Looking the address up by its printable form resolves to the same
    // peer.
    let looked_up = class.addr_lookup(&s).unwrap();
    assert!(class.addr_cmp(&self_addr, &looked_up));

    class.addr_free(looked_up);
    class.addr_free(copy);
    class.addr_free(dup);
    class.addr_free(self_addr);
    class.finalize().map_err(|(_, e)| e).unwrap();
}

#[test]
fn test_context_destroy_busy_and_class_busy() {
    init_logger();
    let class = Class::initialize(&format!("sm://{}", unique_name("dtor")), true).unwrap();
    let ctx = class.context_create().unwrap();
    let self_addr = class.addr_self().unwrap();

    let op = class.op_create().unwrap();
    class
        .msg_send_unexpected(&ctx, |_| {}, b"x", &self_addr, 0, 0, &op)
        .unwrap();

    // A context with an untriggered completion refuses to die.
    let ctx = match class.context_destroy(ctx) {
        Err((ctx, NaError::Busy)) => ctx,
        other => panic!("expected Busy, got {:?}", other.map_err(|(_, e)| e)),
    };

    // A class with a live context refuses to finalize.
    let class = match class.finalize() {
        Err((class, NaError::Busy)) => class,
        other => panic!("expected Busy, got {:?}", other.map_err(|(_, e)| e)),
    };

    ctx.trigger(u32::MAX).unwrap();
    // Drain the cached loopback message.
    class
        .msg_recv_unexpected(&ctx, |_| {}, vec![0u8; 8], &op)
        .unwrap();
    progress_until(&ctx, || op.is_completed() && ctx.completion_count() == 0);

    class.op_destroy(op);
    class.addr_free(self_addr);
    class.context_destroy(ctx).map_err(|(_, e)| e).unwrap();
    class.finalize().map_err(|(_, e)| e).unwrap();
}
