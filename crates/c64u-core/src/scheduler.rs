// ── Strict-priority intent scheduler ──
//
// One instance per protocol. Three FIFO queues (user > system >
// background) feed a bounded pool of concurrently running tasks. The
// concurrency limit is re-read from the live SafetyConfig every time a
// slot frees, so a config reload takes effect without restarting
// in-flight work. Priority applies only at the instant a slot frees: a
// running task is never preempted, and background work yields
// indefinitely to sustained user/system traffic.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use strum::Display;
use tokio::sync::watch;
use tracing::trace;

use crate::config::SafetyConfig;
use crate::gate::Protocol;

/// Priority class of a request, driving strict-priority dequeuing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Intent {
    /// Directly user-initiated; drains first.
    User,
    /// Application housekeeping (refresh loops, status probes).
    System,
    /// Prefetch and other deferrable work; starves under load.
    Background,
}

/// Queue depth and in-flight count, for health displays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub queued_user: usize,
    pub queued_system: usize,
    pub queued_background: usize,
    pub running: u32,
}

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Queues {
    user: VecDeque<BoxedTask>,
    system: VecDeque<BoxedTask>,
    background: VecDeque<BoxedTask>,
    running: u32,
}

impl Queues {
    /// Pop the next task in strict priority order: the user queue is
    /// drained fully before system is even checked, system before
    /// background.
    fn pop_next(&mut self) -> Option<BoxedTask> {
        self.user
            .pop_front()
            .or_else(|| self.system.pop_front())
            .or_else(|| self.background.pop_front())
    }
}

/// Per-protocol concurrency limiter with strict intent priority.
///
/// Cheaply cloneable; clones share the queues.
#[derive(Clone)]
pub struct IntentScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    protocol: Protocol,
    config: watch::Receiver<SafetyConfig>,
    queues: Mutex<Queues>,
}

impl IntentScheduler {
    /// Create a scheduler reading its concurrency limit for `protocol`
    /// from the live config subscription.
    pub fn new(protocol: Protocol, config: watch::Receiver<SafetyConfig>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                protocol,
                config,
                queues: Mutex::new(Queues {
                    user: VecDeque::new(),
                    system: VecDeque::new(),
                    background: VecDeque::new(),
                    running: 0,
                }),
            }),
        }
    }

    /// Enqueue a task under its intent and trigger a drain.
    ///
    /// The task runs to completion once dispatched; queued tasks cannot
    /// be cancelled and no timeout is imposed on the body. Callers that
    /// need a result should complete a channel from inside the task.
    pub fn submit<F>(&self, intent: Intent, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        {
            let mut queues = self.lock_queues();
            let queue = match intent {
                Intent::User => &mut queues.user,
                Intent::System => &mut queues.system,
                Intent::Background => &mut queues.background,
            };
            queue.push_back(Box::pin(task));
        }
        trace!(protocol = %self.inner.protocol, %intent, "task queued");
        self.drain();
    }

    /// Current queue depths and in-flight count.
    pub fn stats(&self) -> SchedulerStats {
        let queues = self.lock_queues();
        SchedulerStats {
            queued_user: queues.user.len(),
            queued_system: queues.system.len(),
            queued_background: queues.background.len(),
            running: queues.running,
        }
    }

    /// Concurrency limit from the live config, floored at 1.
    fn limit(&self) -> u32 {
        let config = self.inner.config.borrow();
        let limit = match self.inner.protocol {
            Protocol::Rest => config.rest_max_concurrency,
            Protocol::Ftp => config.ftp_max_concurrency,
        };
        limit.max(1)
    }

    /// Dispatch queued tasks while free slots remain. Exits without
    /// effect when the queues are empty or all slots are taken.
    fn drain(&self) {
        loop {
            // Pop and increment under one lock hold so `running` can
            // never overshoot the limit, then spawn outside it.
            let task = {
                let limit = self.limit();
                let mut queues = self.lock_queues();
                if queues.running >= limit {
                    break;
                }
                match queues.pop_next() {
                    Some(task) => {
                        queues.running += 1;
                        task
                    }
                    None => break,
                }
            };

            let scheduler = self.clone();
            tokio::spawn(async move {
                // The slot must come back even if the task panics.
                let _slot = SlotRelease(scheduler);
                task.await;
            });
        }
    }

    fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        // Queue operations cannot panic mid-mutation.
        self.inner
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Returns a concurrency slot on drop and re-drains, so an unwinding
/// task cannot permanently shrink the pool.
struct SlotRelease(IntentScheduler);

impl Drop for SlotRelease {
    fn drop(&mut self) {
        self.0.lock_queues().running -= 1;
        self.0.drain();
    }
}
