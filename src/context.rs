//! Progress contexts and the completion pipeline.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use quanta::Instant;

use crate::class::Class;
use crate::error::{NaError, Result};
use crate::op::{CallbackInfo, CompletionRecord, OpId};
use crate::plugin::PluginContext;
use crate::util::queue::AtomicQueue;
use crate::util::spin::Spin;

/// Completion ring capacity per context.
const COMPLETION_QUEUE_SIZE: usize = 1024;

/// Top bit of the multi-progress word: a thread is inside plugin progress.
const PROGRESS_LOCK: u32 = 0x8000_0000;

/// Multi-threaded progress coordinator.
///
/// The atomic packs a progress-in-flight bit with a waiter count; losers
/// park on the condition variable with the remaining timeout.
struct ProgressMulti {
    mutex: Mutex<()>,
    cond: Condvar,
    count: AtomicU32,
}

pub(crate) struct ContextInner {
    class: Class,
    completion_queue: AtomicQueue<CompletionRecord>,
    /// Overflow list taking completions when the ring is full.
    backfill: Spin<VecDeque<Box<CompletionRecord>>>,
    backfill_count: AtomicU32,
    progress: ProgressMulti,
    plugin_context: Box<dyn PluginContext>,
    id: u8,
}

/// Per-thread-group progress domain over a [`Class`].
///
/// Owns the completion pipeline; all progress and callback execution for
/// operations submitted on this context happens through it.
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Context {
    pub(crate) fn new(class: Class, id: u8) -> Result<Self> {
        let plugin_context = class.plugin().context_create(id)?;
        Ok(Self {
            inner: Arc::new(ContextInner {
                class,
                completion_queue: AtomicQueue::new(COMPLETION_QUEUE_SIZE),
                backfill: Spin::new(VecDeque::new()),
                backfill_count: AtomicU32::new(0),
                progress: ProgressMulti {
                    mutex: Mutex::new(()),
                    cond: Condvar::new(),
                    count: AtomicU32::new(0),
                },
                plugin_context,
                id,
            }),
        })
    }

    /// The class this context progresses.
    pub fn class(&self) -> &Class {
        &self.inner.class
    }

    /// Context identifier passed at creation.
    pub fn id(&self) -> u8 {
        self.inner.id
    }

    /// Plugin-private context state.
    pub(crate) fn plugin_context(&self) -> &dyn PluginContext {
        self.inner.plugin_context.as_ref()
    }

    /// Append a completion record to the pipeline.
    ///
    /// Takes the lock-free ring when possible; a full ring spills into the
    /// backfill list.
    pub(crate) fn completion_add(&self, record: Box<CompletionRecord>) {
        if let Err(record) = self.inner.completion_queue.push(record) {
            log::warn!("completion ring is full, pushing record to backfill list");
            let mut backfill = self.inner.backfill.lock();
            backfill.push_back(record);
            self.inner.backfill_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Number of completions waiting to be triggered.
    pub fn completion_count(&self) -> u32 {
        self.inner.completion_queue.count() + self.inner.backfill_count.load(Ordering::Acquire)
    }

    /// Run up to `max` completion callbacks, in completion order.
    ///
    /// For every record, plugin-held resources are released before the user
    /// callback runs, so the plugin never tracks an operation whose user
    /// callback is still pending.
    pub fn trigger(&self, max: u32) -> Result<u32> {
        let mut count = 0;
        while count < max {
            let record = match self.inner.completion_queue.pop_mc() {
                Some(record) => record,
                None => {
                    if self.inner.backfill_count.load(Ordering::Acquire) == 0 {
                        break;
                    }
                    let record = {
                        let mut backfill = self.inner.backfill.lock();
                        match backfill.pop_front() {
                            Some(record) => {
                                self.inner.backfill_count.fetch_sub(1, Ordering::AcqRel);
                                record
                            }
                            // Raced with another trigger; try again.
                            None => continue,
                        }
                    };
                    record
                }
            };

            let CompletionRecord {
                ret,
                kind,
                info,
                callback,
                release,
            } = *record;

            // Plugin resources first: the operation ID may be reused the
            // moment they are gone.
            drop(release);

            if let Some(callback) = callback {
                callback(CallbackInfo { ret, kind, info });
            }
            count += 1;
        }
        Ok(count)
    }

    /// Non-blocking progress on the underlying plugin.
    pub fn poll(&self) -> Result<u32> {
        self.inner.class.plugin().poll(self)
    }

    /// Wakeable descriptor of the underlying plugin, if it has one.
    pub fn poll_get_fd(&self) -> Option<RawFd> {
        self.inner.class.plugin().poll_get_fd(self)
    }

    /// Whether blocking on [`Self::poll_get_fd`] is currently safe.
    pub fn poll_try_wait(&self) -> bool {
        if self.completion_count() > 0 {
            return false;
        }
        self.inner.class.plugin().poll_try_wait(self)
    }

    /// Progress the plugin, blocking up to `timeout_ms` milliseconds.
    ///
    /// Returns the number of completions ready for [`Self::trigger`], or
    /// [`NaError::Timeout`] when the deadline elapses with nothing to do.
    /// Already-queued completions shorten the plugin wait to zero. At most
    /// one thread runs plugin progress at a time; additional callers wait
    /// with the remaining timeout.
    pub fn poll_wait(&self, timeout_ms: u32) -> Result<u32> {
        let progress = &self.inner.progress;
        let mut remaining = Duration::from_millis(u64::from(timeout_ms));

        progress.count.fetch_add(1, Ordering::AcqRel);
        loop {
            let old = progress.count.load(Ordering::Acquire) & !PROGRESS_LOCK;
            let new = old | PROGRESS_LOCK;
            if progress
                .count
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // No other thread is progressing.
                break;
            }

            if remaining.is_zero() {
                progress.count.fetch_sub(1, Ordering::AcqRel);
                return Err(NaError::Timeout);
            }

            let start = Instant::now();
            let guard = progress.mutex.lock().unwrap();
            // Skip the wait if the lock was released in the meantime.
            if progress.count.load(Ordering::Acquire) & PROGRESS_LOCK != 0 {
                let (guard, wait) = progress.cond.wait_timeout(guard, remaining).unwrap();
                drop(guard);
                if wait.timed_out() {
                    progress.count.fetch_sub(1, Ordering::AcqRel);
                    return Err(NaError::Timeout);
                }
            } else {
                drop(guard);
            }
            remaining = remaining.saturating_sub(start.elapsed());
        }

        let ret = self.poll_wait_internal(remaining.as_millis() as u32);

        let mut num;
        loop {
            let old = progress.count.load(Ordering::Acquire);
            num = (old - 1) ^ PROGRESS_LOCK;
            if progress
                .count
                .compare_exchange(old, num, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        if num > 0 {
            // Wake one of the threads parked on the coordinator.
            let _guard = progress.mutex.lock().unwrap();
            progress.cond.notify_one();
        }

        ret
    }

    fn poll_wait_internal(&self, timeout_ms: u32) -> Result<u32> {
        let completion_count = self.completion_count();
        let wait_timeout = if completion_count > 0 { 0 } else { timeout_ms };

        let ret = match self.inner.class.plugin().poll_wait(self, wait_timeout) {
            Some(ret) => ret,
            None => self.busy_poll(wait_timeout),
        };

        match ret {
            Ok(_) => Ok(self.completion_count()),
            Err(NaError::Timeout) if completion_count > 0 => Ok(self.completion_count()),
            Err(err) => Err(err),
        }
    }

    /// Busy-wait fallback for plugins without a blocking progress entry.
    fn busy_poll(&self, timeout_ms: u32) -> Result<u32> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        loop {
            let count = self.inner.class.plugin().poll(self)?;
            if count > 0 {
                return Ok(count);
            }
            if timeout_ms == 0 || Instant::now() >= deadline {
                return Err(NaError::Timeout);
            }
            std::hint::spin_loop();
        }
    }

    /// Cancel an operation submitted on this context.
    ///
    /// Idempotent; cancellation resolves through the operation's callback
    /// with [`NaError::Canceled`], never through this call's return value.
    pub fn cancel(&self, op: &OpId) -> Result<()> {
        log::debug!("canceling op {:?}", op);
        self.inner.class.plugin().cancel(self, op)
    }

    /// Destroy the context.
    ///
    /// Fails `Busy` while completions remain queued or another thread is
    /// progressing; the context is handed back untouched in that case.
    pub fn destroy(self) -> std::result::Result<(), (Self, NaError)> {
        if self.inner.progress.count.load(Ordering::Acquire) > 0 {
            return Err((self, NaError::Busy));
        }
        if self.inner.backfill_count.load(Ordering::Acquire) > 0
            || !self.inner.completion_queue.is_empty()
        {
            return Err((self, NaError::Busy));
        }
        self.inner.class.context_released();
        Ok(())
    }
}
