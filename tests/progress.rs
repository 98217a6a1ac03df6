//! Multi-threaded progress: several `poll_wait` callers share one context
//! while operations complete, and every callback fires exactly once.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use naos::{Class, NaError};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_concurrent_poll_wait_single_completion_per_op() {
    init_logger();
    const SENDS: u32 = 1000;

    let class = Arc::new(
        Class::initialize(&format!("sm://s6-{}", std::process::id()), true).unwrap(),
    );
    let ctx = class.context_create().unwrap();
    let self_addr = class.addr_self().unwrap();

    let fired = Arc::new(AtomicU32::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    // Five concurrent progress threads over the same context.
    let mut workers = Vec::new();
    for _ in 0..5 {
        let ctx = ctx.clone();
        let stop = stop.clone();
        workers.push(std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                match ctx.poll_wait(20) {
                    Ok(_) => {
                        ctx.trigger(u32::MAX).unwrap();
                    }
                    Err(NaError::Timeout) => {}
                    Err(err) => panic!("poll_wait failed: {err}"),
                }
            }
        }));
    }

    // A sixth thread posts the sends, reusing each op only after its
    // callback ran (each callback counts exactly one completion).
    let mut ops = Vec::new();
    for i in 0..SENDS {
        let op = class.op_create().unwrap();
        let fired = fired.clone();
        class
            .msg_send_unexpected(
                &ctx,
                move |info| {
                    assert!(info.ret.is_ok());
                    fired.fetch_add(1, Ordering::SeqCst);
                },
                &i.to_le_bytes(),
                &self_addr,
                0,
                i,
                &op,
            )
            .unwrap();
        ops.push(op);
    }

    let deadline = Instant::now() + Duration::from_secs(30);
    while fired.load(Ordering::SeqCst) < SENDS {
        assert!(Instant::now() < deadline, "sends did not all complete");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(fired.load(Ordering::SeqCst), SENDS);

    // Drain the cached unexpected messages so teardown sees empty queues.
    let drained = Arc::new(AtomicU32::new(0));
    for op in &ops {
        let drained = drained.clone();
        class
            .msg_recv_unexpected(
                &ctx,
                move |info| {
                    assert!(info.ret.is_ok());
                    drained.fetch_add(1, Ordering::SeqCst);
                },
                vec![0u8; 16],
                op,
            )
            .unwrap();
    }
    while drained.load(Ordering::SeqCst) < SENDS {
        assert!(Instant::now() < deadline, "receives did not all complete");
        std::thread::sleep(Duration::from_millis(5));
    }

    stop.store(true, Ordering::Release);
    for worker in workers {
        worker.join().unwrap();
    }

    // One callback per submission, no more.
    assert_eq!(fired.load(Ordering::SeqCst), SENDS);
    assert_eq!(drained.load(Ordering::SeqCst), SENDS);
    assert_eq!(ctx.completion_count(), 0);

    for op in ops {
        class.op_destroy(op);
    }
    class.addr_free(self_addr);
    class.context_destroy(ctx).map_err(|(_, e)| e).unwrap();
    Arc::try_unwrap(class)
        .map_err(|_| ())
        .unwrap()
        .finalize()
        .map_err(|(_, e)| e)
        .unwrap();
}
