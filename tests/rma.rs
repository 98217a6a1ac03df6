//! One-sided put/get between two endpoints of one process, including the
//! serialized-handle exchange.

#![cfg(any(all(target_os = "linux", feature = "cma"), target_os = "macos"))]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use naos::{Class, Context, MemAccess, NaError, OpInfo};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn unique_name(tag: &str) -> String {
    format!("{tag}-{}", std::process::id())
}

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

#[test]
fn test_put_roundtrip_with_serialized_handle() {
    init_logger();
    let name = unique_name("s5");
    let p1 = Class::initialize(&format!("sm://{name}"), true).unwrap();
    let p2 = Class::initialize("sm://", false).unwrap();
    let ctx1 = p1.context_create().unwrap();
    let ctx2 = p2.context_create().unwrap();

    let p1_addr = p2.addr_lookup(&format!("sm://{name}")).unwrap();

    // P1 registers its target buffer and ships the serialized handle over
    // an unexpected message.
    let target = vec![0u8; 4096];
    let target_handle = p1.mem_handle_create(&target, MemAccess::ReadWrite).unwrap();
    let size = p1.mem_handle_get_serialize_size(&target_handle).unwrap();
    let mut handle_bytes = vec![0u8; size];
    p1.mem_handle_serialize(&mut handle_bytes, &target_handle)
        .unwrap();

    let recv_op = p1.op_create().unwrap();
    let send_op = p2.op_create().unwrap();
    let received = Arc::new(Mutex::new(None));
    {
        let received = received.clone();
        p1.msg_recv_unexpected(
            &ctx1,
            move |info| {
                *received.lock().unwrap() = Some(info);
            },
            vec![0u8; 4096],
            &recv_op,
        )
        .unwrap();
    }
    p2.msg_send_unexpected(
        &ctx2,
        |info| assert!(info.ret.is_ok()),
        &handle_bytes,
        &p1_addr,
        0,
        0,
        &send_op,
    )
    .unwrap();
    progress_both(&ctx2, &ctx1, || received.lock().unwrap().is_some());

    let remote_bytes = match received.lock().unwrap().take().unwrap().info {
        OpInfo::RecvUnexpected {
            buf,
            actual_size,
            source,
            ..
        } => {
            drop(source);
            buf[..actual_size].to_vec()
        }
        other => panic!("unexpected callback info: {other:?}"),
    };

    // P2 reconstructs the handle and writes 4096 bytes of 0x5A into P1.
    let remote_handle = p2.mem_handle_deserialize(&remote_bytes).unwrap();
    let payload = vec![0x5Au8; 4096];
    let local_handle = p2.mem_handle_create(&payload, MemAccess::ReadOnly).unwrap();

    let put_op = p2.op_create().unwrap();
    let put_done = Arc::new(AtomicU32::new(0));
    {
        let put_done = put_done.clone();
        p2.put(
            &ctx2,
            move |info| {
                assert!(info.ret.is_ok());
                put_done.fetch_add(1, Ordering::SeqCst);
            },
            &local_handle,
            0,
            &remote_handle,
            0,
            4096,
            &p1_addr,
            0,
            &put_op,
        )
        .unwrap();
    }
    progress_both(&ctx2, &ctx1, || put_done.load(Ordering::SeqCst) == 1);

    assert_eq!(target, payload);

    // And read it back with a get into a fresh buffer.
    let readback = vec![0u8; 4096];
    let readback_handle = p2.mem_handle_create(&readback, MemAccess::WriteOnly).unwrap();
    let get_op = p2.op_create().unwrap();
    let get_done = Arc::new(AtomicU32::new(0));
    {
        let get_done = get_done.clone();
        p2.get(
            &ctx2,
            move |info| {
                assert!(info.ret.is_ok());
                get_done.fetch_add(1, Ordering::SeqCst);
            },
            &readback_handle,
            0,
            &remote_handle,
            0,
            4096,
            &p1_addr,
            0,
            &get_op,
        )
        .unwrap();
    }
    progress_both(&ctx2, &ctx1, || get_done.load(Ordering::SeqCst) == 1);
    assert_eq!(readback, payload);

    p2.mem_handle_free(local_handle);
    p2.mem_handle_free(readback_handle);
    p2.mem_handle_free(remote_handle);
    p1.mem_handle_free(target_handle);
    p1.op_destroy(recv_op);
    p2.op_destroy(send_op);
    p2.op_destroy(put_op);
    p2.op_destroy(get_op);
    p2.addr_free(p1_addr);
    p2.context_destroy(ctx2).map_err(|(_, e)| e).unwrap();
    p1.context_destroy(ctx1).map_err(|(_, e)| e).unwrap();
    p2.finalize().map_err(|(_, e)| e).unwrap();
    p1.finalize().map_err(|(_, e)| e).unwrap();
}

#[test]
fn test_rma_access_flags_enforced() {
    init_logger();
    let class = Class::initialize(&format!("sm://{}", unique_name("perm")), true).unwrap();
    let ctx = class.context_create().unwrap();
    let self_addr = class.addr_self().unwrap();

    let src = vec![1u8; 128];
    let dst = vec![0u8; 128];
    let local = class.mem_handle_create(&src, MemAccess::ReadOnly).unwrap();
    let readonly_remote = class.mem_handle_create(&dst, MemAccess::ReadOnly).unwrap();
    let writeonly_remote = class.mem_handle_create(&dst, MemAccess::WriteOnly).unwrap();

    let op = class.op_create().unwrap();
    assert!(matches!(
        class.put(&ctx, |_| {}, &local, 0, &readonly_remote, 0, 128, &self_addr, 0, &op),
        Err(NaError::Permission)
    ));
    assert!(matches!(
        class.get(&ctx, |_| {}, &local, 0, &writeonly_remote, 0, 128, &self_addr, 0, &op),
        Err(NaError::Permission)
    ));
    // Out-of-bounds windows are rejected before any syscall.
    let rw_remote = class.mem_handle_create(&dst, MemAccess::ReadWrite).unwrap();
    assert!(matches!(
        class.put(&ctx, |_| {}, &local, 64, &rw_remote, 0, 128, &self_addr, 0, &op),
        Err(NaError::InvalidArg)
    ));
    // Submit-path failures never queue a completion.
    assert_eq!(ctx.completion_count(), 0);
    assert!(op.is_completed());

    class.mem_handle_free(local);
    class.mem_handle_free(readonly_remote);
    class.mem_handle_free(writeonly_remote);
    class.mem_handle_free(rw_remote);
    class.op_destroy(op);
    class.addr_free(self_addr);
    class.context_destroy(ctx).map_err(|(_, e)| e).unwrap();
    class.finalize().map_err(|(_, e)| e).unwrap();
}

#[test]
fn test_mem_handle_segment_roundtrip() {
    init_logger();
    let class = Class::initialize(&format!("sm://{}", unique_name("segs")), true).unwrap();

    let a = vec![0u8; 512];
    let b = vec![0u8; 1024];
    let segments = [
        naos::Segment {
            base: a.as_ptr() as u64,
            len: a.len() as u64,
        },
        naos::Segment {
            base: b.as_ptr() as u64,
            len: b.len() as u64,
        },
    ];
    let handle = class
        .mem_handle_create_segments(&segments, MemAccess::ReadWrite)
        .unwrap();

    let size = class.mem_handle_get_serialize_size(&handle).unwrap();
    let mut bytes = vec![0u8; size];
    class.mem_handle_serialize(&mut bytes, &handle).unwrap();
    let copy = class.mem_handle_deserialize(&bytes).unwrap();
    // Same segment list after a round trip.
    assert_eq!(class.mem_handle_get_serialize_size(&copy).unwrap(), size);

    // A short buffer is rejected up front.
    let mut short = vec![0u8; size - 1];
    assert!(matches!(
        class.mem_handle_serialize(&mut short, &handle),
        Err(NaError::Overflow)
    ));

    class.mem_handle_free(copy);
    class.mem_handle_free(handle);
    class.finalize().map_err(|(_, e)| e).unwrap();
}
