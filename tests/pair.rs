//! Two endpoints in one process: expected-message matching and the retry
//! queue under ring back-pressure.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use naos::{Addr, Class, Context, OpInfo};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn unique_name(tag: &str) -> String {
    format!("{tag}-{}", std::process::id())
}

/// Drive both endpoints until `done`, non-blocking on each side.
fn progress_both(a: &Context, b: &Context, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for completions");
        a.poll().unwrap();
        a.trigger(u32::MAX).unwrap();
        b.poll().unwrap();
        b.trigger(u32::MAX).unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Deliver one unexpected message and hand back the receiver-side source
/// address, which is how an endpoint learns who its peer is.
fn handshake(
    sender: &Class,
    sender_ctx: &Context,
    dest: &Addr,
    receiver: &Class,
    receiver_ctx: &Context,
) -> Addr {
    let send_op = sender.op_create().unwrap();
    let recv_op = receiver.op_create().unwrap();

    let source = Arc::new(Mutex::new(None));
    {
        let source = source.clone();
        receiver
            .msg_recv_unexpected(
                receiver_ctx,
                move |info| {
                    if let OpInfo::RecvUnexpected { source: src, .. } = info.info {
                        *source.lock().unwrap() = src;
                    }
                },
                vec![0u8; 8],
                &recv_op,
            )
            .unwrap();
    }
    sender
        .msg_send_unexpected(
            sender_ctx,
            |info| assert!(info.ret.is_ok()),
            b"hi",
            dest,
            0,
            1,
            &send_op,
        )
        .unwrap();

    progress_both(sender_ctx, receiver_ctx, || source.lock().unwrap().is_some());

    sender.op_destroy(send_op);
    receiver.op_destroy(recv_op);
    let addr = source.lock().unwrap().take().unwrap();
    addr
}

#[test]
fn test_expected_tag_match_and_drop() {
    init_logger();
    let name = unique_name("s2");
    let p1 = Class::initialize(&format!("sm://{name}"), true).unwrap();
    let p2 = Class::initialize("sm://", false).unwrap();

    let ctx1 = p1.context_create().unwrap();
    let ctx2 = p2.context_create().unwrap();

    let p1_addr = p2.addr_lookup(&format!("sm://{name}")).unwrap();
    // P1 learns P2's address from an initial unexpected message.
    let p2_addr = handshake(&p2, &ctx2, &p1_addr, &p1, &ctx1);

    // Pre-post the matching receive, then send with the same tag.
    let recv_op = p1.op_create().unwrap();
    let send_op = p2.op_create().unwrap();
    let received = Arc::new(Mutex::new(None));
    {
        let received = received.clone();
        p1.msg_recv_expected(
            &ctx1,
            move |info| {
                *received.lock().unwrap() = Some(info);
            },
            vec![0u8; 128],
            &p2_addr,
            0,
            42,
            &recv_op,
        )
        .unwrap();
    }
    let payload = vec![0xA5u8; 128];
    p2.msg_send_expected(
        &ctx2,
        |info| assert!(info.ret.is_ok()),
        &payload,
        &p1_addr,
        0,
        42,
        &send_op,
    )
    .unwrap();

    progress_both(&ctx2, &ctx1, || received.lock().unwrap().is_some());
    let info = received.lock().unwrap().take().unwrap();
    assert!(info.ret.is_ok());
    match info.info {
        OpInfo::RecvExpected { buf, actual_size } => {
            assert_eq!(actual_size, 128);
            assert_eq!(buf, payload);
        }
        other => panic!("unexpected callback info: {other:?}"),
    }

    // A tag nothing is posted for is dropped with a warning; no callback
    // ever fires on the receiver.
    let stray_op = p2.op_create().unwrap();
    p2.msg_send_expected(
        &ctx2,
        |info| assert!(info.ret.is_ok()),
        b"stray",
        &p1_addr,
        0,
        43,
        &stray_op,
    )
    .unwrap();
    progress_both(&ctx2, &ctx1, || stray_op.is_completed());
    for _ in 0..20 {
        ctx1.poll().unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(ctx1.completion_count(), 0);

    p1.op_destroy(recv_op);
    p2.op_destroy(send_op);
    p2.op_destroy(stray_op);
    p1.addr_free(p2_addr);
    p2.addr_free(p1_addr);
    p2.context_destroy(ctx2).map_err(|(_, e)| e).unwrap();
    p1.context_destroy(ctx1).map_err(|(_, e)| e).unwrap();
    p2.finalize().map_err(|(_, e)| e).unwrap();
    p1.finalize().map_err(|(_, e)| e).unwrap();
}

#[test]
fn test_retry_queue_preserves_order_under_backpressure() {
    init_logger();
    let name = unique_name("s3");
    let p1 = Class::initialize("sm://", false).unwrap();
    let p2 = Class::initialize(&format!("sm://{name}"), true).unwrap();

    let ctx1 = p1.context_create().unwrap();
    let ctx2 = p2.context_create().unwrap();

    let p2_addr = p1.addr_lookup(&format!("sm://{name}")).unwrap();

    // More messages than one rx ring can hold, so the tail lands on the
    // retry queue while P2 is not consuming.
    const TOTAL: u32 = 80;

    let recv_tags = Arc::new(Mutex::new(Vec::new()));
    let mut recv_ops = Vec::new();
    for _ in 0..TOTAL {
        let op = p2.op_create().unwrap();
        let recv_tags = recv_tags.clone();
        p2.msg_recv_unexpected(
            &ctx2,
            move |info| {
                assert!(info.ret.is_ok());
                if let OpInfo::RecvUnexpected { tag, source, .. } = info.info {
                    recv_tags.lock().unwrap().push(tag);
                    drop(source);
                }
            },
            vec![0u8; 64],
            &op,
        )
        .unwrap();
        recv_ops.push(op);
    }

    let sent = Arc::new(AtomicU32::new(0));
    let mut send_ops = Vec::new();
    for tag in 0..TOTAL {
        let op = p1.op_create().unwrap();
        let sent = sent.clone();
        // Every submit returns Success even when the ring is full; the op
        // parks on the retry queue instead.
        p1.msg_send_unexpected(
            &ctx1,
            move |info| {
                assert!(info.ret.is_ok());
                sent.fetch_add(1, Ordering::SeqCst);
            },
            &tag.to_le_bytes(),
            &p2_addr,
            0,
            tag,
            &op,
        )
        .unwrap();
        send_ops.push(op);
    }

    progress_both(&ctx1, &ctx2, || {
        sent.load(Ordering::SeqCst) == TOTAL && recv_tags.lock().unwrap().len() == TOTAL as usize
    });

    // FIFO per queue pair: tags arrive in send order.
    let recv_tags = recv_tags.lock().unwrap();
    assert_eq!(*recv_tags, (0..TOTAL).collect::<Vec<_>>());

    for op in send_ops {
        p1.op_destroy(op);
    }
    for op in recv_ops {
        p2.op_destroy(op);
    }
    p1.addr_free(p2_addr);
    p1.context_destroy(ctx1).map_err(|(_, e)| e).unwrap();
    p2.context_destroy(ctx2).map_err(|(_, e)| e).unwrap();
    p1.finalize().map_err(|(_, e)| e).unwrap();
    p2.finalize().map_err(|(_, e)| e).unwrap();
}

#[test]
fn test_cancel_retried_send() {
    init_logger();
    let name = unique_name("s3c");
    let p1 = Class::initialize("sm://", false).unwrap();
    let p2 = Class::initialize(&format!("sm://{name}"), true).unwrap();

    let ctx1 = p1.context_create().unwrap();
    let p2_addr = p1.addr_lookup(&format!("sm://{name}")).unwrap();

    // Fill the rx ring without P2 consuming anything.
    let mut filler_ops = Vec::new();
    let inline = Arc::new(AtomicU32::new(0));
    loop {
        let op = p1.op_create().unwrap();
        let inline_count = inline.clone();
        p1.msg_send_unexpected(
            &ctx1,
            move |info| {
                if info.ret.is_ok() {
                    inline_count.fetch_add(1, Ordering::SeqCst);
                }
            },
            b"fill",
            &p2_addr,
            0,
            0,
            &op,
        )
        .unwrap();
        let parked = !op.is_completed();
        filler_ops.push(op);
        if parked {
            break;
        }
        ctx1.trigger(u32::MAX).unwrap();
    }

    // The last submission is parked on the retry queue; cancel resolves it
    // through its callback with Canceled.
    let parked_op = filler_ops.last().unwrap();
    ctx1.cancel(parked_op).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !parked_op.is_completed() {
        assert!(Instant::now() < deadline);
        ctx1.poll().unwrap();
        ctx1.trigger(u32::MAX).unwrap();
    }
    ctx1.trigger(u32::MAX).unwrap();

    // Drain P2 so teardown finds empty queues.
    let ctx2 = p2.context_create().unwrap();
    let drained = Arc::new(AtomicU32::new(0));
    let target = inline.load(Ordering::SeqCst);
    let mut recv_ops = Vec::new();
    for _ in 0..target {
        let op = p2.op_create().unwrap();
        let drained = drained.clone();
        p2.msg_recv_unexpected(
            &ctx2,
            move |_| {
                drained.fetch_add(1, Ordering::SeqCst);
            },
            vec![0u8; 16],
            &op,
        )
        .unwrap();
        recv_ops.push(op);
    }
    progress_both(&ctx1, &ctx2, || drained.load(Ordering::SeqCst) == target);

    for op in recv_ops {
        p2.op_destroy(op);
    }
    for op in filler_ops {
        p1.op_destroy(op);
    }
    p1.addr_free(p2_addr);
    p1.context_destroy(ctx1).map_err(|(_, e)| e).unwrap();
    p2.context_destroy(ctx2).map_err(|(_, e)| e).unwrap();
    p1.finalize().map_err(|(_, e)| e).unwrap();
    p2.finalize().map_err(|(_, e)| e).unwrap();
}
