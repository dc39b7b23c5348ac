/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use anyhow::Result;
use once_cell::sync::Lazy;
use tokio::runtime::Handle;
use tokio::runtime::Runtime;
use tracing::warn;

use crate::cell::Deferred;
use crate::shared_error::SharedError;

static GLOBAL: Lazy<Scheduler> = Lazy::new(|| {
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("rill-timer")
        .enable_all()
        .build()
        .expect("failed to build the timer pool");
    Scheduler {
        inner: Arc::new(Pool::Owned(runtime)),
    }
});

enum Pool {
    Owned(Runtime),
    Injected(Handle),
}

impl Pool {
    fn handle(&self) -> &Handle {
        match self {
            Pool::Owned(runtime) => runtime.handle(),
            Pool::Injected(handle) => handle,
        }
    }
}

/// A handle to the timer pool used for timed execution.
///
/// [Scheduler::global] returns the process-wide pool, lazily instantiated
/// with as many worker threads as the host has hardware parallelism and kept
/// for the lifetime of the process. Callers that want their own runtime to
/// drive timers can build a scheduler around any tokio handle with
/// [Scheduler::from_handle].
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Pool>,
}

impl Scheduler {
    /// The shared process-wide timer pool.
    pub fn global() -> &'static Scheduler {
        &GLOBAL
    }

    /// A scheduler driving its work on the given runtime handle.
    pub fn from_handle(handle: Handle) -> Scheduler {
        Scheduler {
            inner: Arc::new(Pool::Injected(handle)),
        }
    }

    /// Spawns a future onto the pool.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.inner.handle().spawn(future);
    }

    /// A deferred that resolves after the given delay.
    pub fn sleep(&self, delay: Duration) -> Deferred<()> {
        let done = Deferred::new();
        let resolver = done.clone();
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            resolver.succeed(());
        });
        done
    }

    /// Runs `f` once after `delay`. The returned deferred resolves to the
    /// function's value, or fails with its error.
    pub fn run_in<T, F>(&self, delay: Duration, f: F) -> Deferred<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let out = Deferred::new();
        let resolver = out.clone();
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            resolver.resolve(f().map_err(SharedError::from));
        });
        out
    }

    /// Runs `f` once at the given wall-clock time, immediately if it is
    /// already in the past.
    pub fn run_at<T, F>(&self, when: SystemTime, f: F) -> Deferred<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let delay = when
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        self.run_in(delay, f)
    }

    /// Runs `f` at a fixed rate, first after `initial_delay` and then every
    /// `period`. An `Err` from `f` is logged and cancels the ticket;
    /// cancelling via the returned [Ticket] prevents further ticks but does
    /// not interrupt a tick already running.
    ///
    /// Panics if `period` is zero.
    pub fn run_every<F>(&self, period: Duration, initial_delay: Duration, mut f: F) -> Ticket
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        assert!(period > Duration::ZERO, "period must be non-zero");
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        self.spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut ticks = tokio::time::interval(period);
            loop {
                ticks.tick().await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = f() {
                    warn!(error = %e, "periodic task failed, cancelling");
                    flag.store(true, Ordering::SeqCst);
                    break;
                }
            }
        });
        Ticket { cancelled }
    }
}

/// Cancellable ticket for a [Scheduler::run_every] task. Cancellation is
/// idempotent.
pub struct Ticket {
    cancelled: Arc<AtomicBool>,
}

impl Ticket {
    /// Stops future ticks. A tick already running is not interrupted.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the ticket has been cancelled (explicitly or by a failing
    /// tick).
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn run_in_resolves_to_the_value() {
        let d = Scheduler::global().run_in(Duration::from_millis(5), || Ok(17));
        assert_matches!(d.await, Ok(17));
    }

    #[tokio::test]
    async fn run_in_propagates_errors() {
        let d: Deferred<u32> =
            Scheduler::global().run_in(Duration::from_millis(5), || Err(anyhow::anyhow!("nope")));
        assert_matches!(d.await, Err(_));
    }

    #[tokio::test]
    async fn run_at_in_the_past_runs_immediately() {
        let past = SystemTime::now() - Duration::from_secs(10);
        let d = Scheduler::global().run_at(past, || Ok("now"));
        assert_matches!(d.await, Ok("now"));
    }

    #[tokio::test]
    async fn run_every_ticks_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let ticket = Scheduler::global().run_every(Duration::from_millis(10), Duration::ZERO, {
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        ticket.cancel();
        ticket.cancel();
        let after_cancel = count.load(Ordering::SeqCst);
        assert!(after_cancel >= 2, "expected several ticks");
        tokio::time::sleep(Duration::from_millis(50)).await;
        // One tick may have been in flight when the flag flipped.
        assert!(count.load(Ordering::SeqCst) <= after_cancel + 1);
    }

    #[tokio::test]
    async fn run_every_cancels_itself_on_error() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let ticket = Scheduler::global().run_every(Duration::from_millis(5), Duration::ZERO, {
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("tick failed"))
            }
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(ticket.is_cancelled());
    }

    #[tokio::test]
    async fn sleep_resolves() {
        let d = Scheduler::global().sleep(Duration::from_millis(5));
        assert_matches!(d.await, Ok(()));
    }

    #[tokio::test]
    async fn injected_scheduler_uses_the_given_runtime() {
        let scheduler = Scheduler::from_handle(Handle::current());
        let d = scheduler.run_in(Duration::from_millis(1), || Ok(1u32));
        assert_matches!(d.await, Ok(1));
    }
}
