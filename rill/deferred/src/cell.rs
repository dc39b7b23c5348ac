/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;

use crate::scheduler::Scheduler;
use crate::shared_error::SharedError;

/// Error used to fail a [Deferred] whose [Deferred::timeout] elapsed.
#[derive(Debug, Clone, Error)]
#[error("deferred timed out after {0:?}")]
pub struct TimeoutError(pub Duration);

type Callback<T> = Box<dyn FnOnce(Result<T, SharedError>) + Send>;

enum State<T> {
    Pending {
        callbacks: Vec<Callback<T>>,
        wakers: Vec<Waker>,
    },
    Realized(Result<T, SharedError>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    executor: Option<Handle>,
}

/// A write-once cell holding one of pending, success or error.
///
/// Handles are cheap to clone and all observe the same cell. Resolution is
/// atomic and happens at most once; continuations registered with
/// [Deferred::on_realized] run exactly once, in registration order, with the
/// final result. A `Deferred` is also a [Future] resolving to
/// `Result<T, SharedError>`.
pub struct Deferred<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().expect("lock poisoned");
        match &*state {
            State::Pending { .. } => write!(f, "Deferred(pending)"),
            State::Realized(Ok(_)) => write!(f, "Deferred(ok)"),
            State::Realized(Err(e)) => write!(f, "Deferred(err: {})", e),
        }
    }
}

impl<T> Deferred<T>
where
    T: Clone + Send + 'static,
{
    /// A new pending deferred.
    pub fn new() -> Self {
        Self::with_dispatch(None)
    }

    /// A new pending deferred whose continuations are spawned onto the given
    /// executor instead of running inline on the resolving thread.
    pub fn with_executor(executor: Handle) -> Self {
        Self::with_dispatch(Some(executor))
    }

    fn with_dispatch(executor: Option<Handle>) -> Self {
        Deferred {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending {
                    callbacks: Vec::new(),
                    wakers: Vec::new(),
                }),
                executor,
            }),
        }
    }

    /// A deferred already realized with a value.
    pub fn ok(value: T) -> Self {
        let d = Self::new();
        d.succeed(value);
        d
    }

    /// A deferred already realized with an error.
    pub fn err(error: impl Into<SharedError>) -> Self {
        let d = Self::new();
        d.fail(error);
        d
    }

    /// Realizes the deferred with a value. Returns `false` if it was already
    /// realized.
    pub fn succeed(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    /// Realizes the deferred with an error. Returns `false` if it was already
    /// realized.
    pub fn fail(&self, error: impl Into<SharedError>) -> bool {
        self.resolve(Err(error.into()))
    }

    /// Realizes the deferred with a full result. Returns `false` if it was
    /// already realized.
    pub fn resolve(&self, result: Result<T, SharedError>) -> bool {
        let (callbacks, wakers) = {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            match &mut *state {
                State::Pending { callbacks, wakers } => {
                    let callbacks = std::mem::take(callbacks);
                    let wakers = std::mem::take(wakers);
                    *state = State::Realized(result.clone());
                    (callbacks, wakers)
                }
                State::Realized(_) => return false,
            }
        };
        for callback in callbacks {
            self.dispatch(callback, result.clone());
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    fn dispatch(&self, callback: Callback<T>, result: Result<T, SharedError>) {
        match &self.inner.executor {
            Some(executor) => {
                let _ = executor.spawn(async move { callback(result) });
            }
            None => callback(result),
        }
    }

    /// Whether the deferred has been realized.
    pub fn is_realized(&self) -> bool {
        matches!(
            &*self.inner.state.lock().expect("lock poisoned"),
            State::Realized(_)
        )
    }

    /// The result, if already realized.
    pub fn peek(&self) -> Option<Result<T, SharedError>> {
        match &*self.inner.state.lock().expect("lock poisoned") {
            State::Realized(result) => Some(result.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Registers a continuation to run with the final result. If the deferred
    /// is already realized the continuation runs immediately on the calling
    /// thread (or on the configured executor).
    pub fn on_realized<F>(&self, f: F)
    where
        F: FnOnce(Result<T, SharedError>) + Send + 'static,
    {
        let mut f = Some(f);
        let realized = {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            match &mut *state {
                State::Pending { callbacks, .. } => {
                    callbacks.push(Box::new(f.take().expect("f not yet taken")));
                    None
                }
                State::Realized(result) => Some(result.clone()),
            }
        };
        if let Some(result) = realized {
            self.dispatch(Box::new(f.take().expect("f not yet taken")), result);
        }
    }

    /// A deferred of `f` applied to this deferred's value. An error
    /// short-circuits past `f`.
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let out = Deferred::new();
        let downstream = out.clone();
        self.on_realized(move |result| {
            downstream.resolve(result.map(f));
        });
        out
    }

    /// Like [Deferred::map] but `f` may fail, failing the output.
    pub fn try_map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        let out = Deferred::new();
        let downstream = out.clone();
        self.on_realized(move |result| {
            downstream.resolve(result.and_then(|value| f(value).map_err(SharedError::from)));
        });
        out
    }

    /// Sequences another deferred after this one: once this deferred yields a
    /// value, `f` produces a follow-up deferred whose result realizes the
    /// output. Errors at either stage short-circuit.
    pub fn chain<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Deferred<U> + Send + 'static,
    {
        let out = Deferred::new();
        let downstream = out.clone();
        self.on_realized(move |result| match result {
            Ok(value) => {
                let next = f(value);
                next.on_realized(move |result| {
                    downstream.resolve(result);
                });
            }
            Err(e) => {
                downstream.fail(e);
            }
        });
        out
    }

    /// Intercepts an error. The handler may recover with a replacement value
    /// or pass the error (or a different one) through; successful values are
    /// untouched.
    pub fn catch<F>(&self, f: F) -> Deferred<T>
    where
        F: FnOnce(SharedError) -> Result<T, SharedError> + Send + 'static,
    {
        let out = Deferred::new();
        let downstream = out.clone();
        self.on_realized(move |result| {
            downstream.resolve(result.or_else(f));
        });
        out
    }

    /// A deferred that fails with [TimeoutError] if this one is still pending
    /// after `duration`. The timeout only unblocks observers of the returned
    /// deferred; it does not rescind work feeding this one.
    pub fn timeout(&self, duration: Duration) -> Deferred<T> {
        let out = self.passthrough();
        let deadline = out.clone();
        Scheduler::global().spawn(async move {
            tokio::time::sleep(duration).await;
            deadline.fail(SharedError::new(TimeoutError(duration)));
        });
        out
    }

    /// Like [Deferred::timeout], but resolves to `default` instead of failing
    /// when the duration elapses first.
    pub fn timeout_or(&self, duration: Duration, default: T) -> Deferred<T> {
        let out = self.passthrough();
        let deadline = out.clone();
        Scheduler::global().spawn(async move {
            tokio::time::sleep(duration).await;
            deadline.succeed(default);
        });
        out
    }

    fn passthrough(&self) -> Deferred<T> {
        let out = Deferred::new();
        let downstream = out.clone();
        self.on_realized(move |result| {
            downstream.resolve(result);
        });
        out
    }

    /// Blocks the calling thread until the deferred is realized. For use at
    /// interop boundaries only; never call this from an async context.
    pub fn wait(&self) -> Result<T, SharedError> {
        futures::executor::block_on(self.clone())
    }
}

impl<T> Default for Deferred<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Future for Deferred<T>
where
    T: Clone + Send + 'static,
{
    type Output = Result<T, SharedError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock().expect("lock poisoned");
        match &mut *state {
            State::Realized(result) => Poll::Ready(result.clone()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

/// A deferred of both values. Fails as soon as either input fails.
pub fn zip<A, B>(a: &Deferred<A>, b: &Deferred<B>) -> Deferred<(A, B)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    let out = Deferred::new();
    let slots = Arc::new(Mutex::new((None::<A>, None::<B>)));

    let downstream = out.clone();
    let pair = Arc::clone(&slots);
    a.on_realized(move |result| match result {
        Ok(value) => {
            let ready = {
                let mut pair = pair.lock().expect("lock poisoned");
                pair.0 = Some(value);
                pair.0.is_some() && pair.1.is_some()
            };
            if ready {
                let mut pair = pair.lock().expect("lock poisoned");
                if let (Some(a), Some(b)) = (pair.0.take(), pair.1.take()) {
                    downstream.succeed((a, b));
                }
            }
        }
        Err(e) => {
            downstream.fail(e);
        }
    });

    let downstream = out.clone();
    let pair = Arc::clone(&slots);
    b.on_realized(move |result| match result {
        Ok(value) => {
            let ready = {
                let mut pair = pair.lock().expect("lock poisoned");
                pair.1 = Some(value);
                pair.0.is_some() && pair.1.is_some()
            };
            if ready {
                let mut pair = pair.lock().expect("lock poisoned");
                if let (Some(a), Some(b)) = (pair.0.take(), pair.1.take()) {
                    downstream.succeed((a, b));
                }
            }
        }
        Err(e) => {
            downstream.fail(e);
        }
    });

    out
}

/// A deferred of all three values. Fails as soon as any input fails.
pub fn zip3<A, B, C>(a: &Deferred<A>, b: &Deferred<B>, c: &Deferred<C>) -> Deferred<(A, B, C)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    C: Clone + Send + 'static,
{
    zip(&zip(a, b), c).map(|((a, b), c)| (a, b, c))
}

/// A deferred of all values, in input order. Fails as soon as any input
/// fails. An empty input realizes immediately with an empty vector.
pub fn zip_all<T>(deferreds: Vec<Deferred<T>>) -> Deferred<Vec<T>>
where
    T: Clone + Send + 'static,
{
    if deferreds.is_empty() {
        return Deferred::ok(Vec::new());
    }

    struct Slots<T> {
        values: Vec<Option<T>>,
        remaining: usize,
    }

    let out = Deferred::new();
    let slots = Arc::new(Mutex::new(Slots {
        values: vec![None; deferreds.len()],
        remaining: deferreds.len(),
    }));

    for (index, deferred) in deferreds.into_iter().enumerate() {
        let downstream = out.clone();
        let slots = Arc::clone(&slots);
        deferred.on_realized(move |result| match result {
            Ok(value) => {
                let complete = {
                    let mut slots = slots.lock().expect("lock poisoned");
                    slots.values[index] = Some(value);
                    slots.remaining -= 1;
                    if slots.remaining == 0 {
                        Some(
                            slots
                                .values
                                .iter_mut()
                                .map(|slot| slot.take().expect("all slots filled"))
                                .collect::<Vec<_>>(),
                        )
                    } else {
                        None
                    }
                };
                if let Some(values) = complete {
                    downstream.succeed(values);
                }
            }
            Err(e) => {
                downstream.fail(e);
            }
        });
    }

    out
}

/// The continuation decision of a [loop_fn] step.
#[derive(Debug, Clone)]
pub enum Loop<S, T> {
    /// Run another iteration with the given state.
    Continue(S),
    /// Finish the loop with the given value.
    Break(T),
}

/// Tail-recursive chaining of deferreds without stack growth.
///
/// `step` is invoked with the loop state and yields a deferred deciding
/// whether to continue with new state or break with a final value. Steps
/// whose deferreds are already realized are driven by an explicit loop, so
/// long synchronous runs do not recurse.
pub fn loop_fn<S, T, F>(init: S, step: F) -> Deferred<T>
where
    S: Clone + Send + 'static,
    T: Clone + Send + 'static,
    F: FnMut(S) -> Deferred<Loop<S, T>> + Send + 'static,
{
    let out = Deferred::new();
    drive(out.clone(), init, step);
    out
}

fn drive<S, T, F>(out: Deferred<T>, init: S, mut step: F)
where
    S: Clone + Send + 'static,
    T: Clone + Send + 'static,
    F: FnMut(S) -> Deferred<Loop<S, T>> + Send + 'static,
{
    let mut state = init;
    loop {
        let decision = step(state);
        match decision.peek() {
            Some(Ok(Loop::Continue(next))) => {
                state = next;
            }
            Some(Ok(Loop::Break(value))) => {
                out.succeed(value);
                return;
            }
            Some(Err(e)) => {
                out.fail(e);
                return;
            }
            None => {
                decision.on_realized(move |result| match result {
                    Ok(Loop::Continue(next)) => drive(out, next, step),
                    Ok(Loop::Break(value)) => {
                        out.succeed(value);
                    }
                    Err(e) => {
                        out.fail(e);
                    }
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn resolves_at_most_once() {
        let d = Deferred::new();
        assert!(d.succeed(1));
        assert!(!d.succeed(2));
        assert!(!d.fail(SharedError::new(anyhow::anyhow!("late"))));
        assert_matches!(d.peek(), Some(Ok(1)));
    }

    #[test]
    fn continuations_run_in_registration_order() {
        let d: Deferred<u32> = Deferred::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..4 {
            let order = Arc::clone(&order);
            d.on_realized(move |_| order.lock().unwrap().push(tag));
        }
        d.succeed(7);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn late_registration_runs_immediately() {
        let d = Deferred::ok(5);
        let seen = Arc::new(AtomicUsize::new(0));
        let observer = Arc::clone(&seen);
        d.on_realized(move |result| {
            observer.store(result.unwrap() as usize, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn chain_applies_to_realized_value() {
        let d = Deferred::ok(2);
        let chained = d.chain(|v| Deferred::ok(v * 10)).map(|v| v + 1);
        assert_matches!(chained.peek(), Some(Ok(21)));
    }

    #[test]
    fn chain_short_circuits_on_error() {
        let d: Deferred<u32> = Deferred::err(SharedError::new(anyhow::anyhow!("boom")));
        let called = Arc::new(AtomicUsize::new(0));
        let witness = Arc::clone(&called);
        let chained = d.chain(move |v| {
            witness.fetch_add(1, Ordering::SeqCst);
            Deferred::ok(v)
        });
        assert_matches!(chained.peek(), Some(Err(_)));
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn catch_recovers() {
        let d: Deferred<u32> = Deferred::err(SharedError::new(anyhow::anyhow!("boom")));
        let recovered = d.catch(|_| Ok(42));
        assert_matches!(recovered.peek(), Some(Ok(42)));
    }

    #[test]
    fn catch_can_pass_through() {
        let d: Deferred<u32> = Deferred::err(SharedError::new(anyhow::anyhow!("boom")));
        let passed = d.catch(Err);
        assert_matches!(passed.peek(), Some(Err(_)));
    }

    #[test]
    fn try_map_failure_fails_downstream() {
        let d = Deferred::ok(1);
        let failed: Deferred<u32> = d.try_map(|_| Err(anyhow::anyhow!("no")));
        assert_matches!(failed.peek(), Some(Err(_)));
    }

    #[test]
    fn zip_waits_for_both() {
        let a = Deferred::new();
        let b = Deferred::new();
        let both = zip(&a, &b);
        a.succeed(1);
        assert!(both.peek().is_none());
        b.succeed("x");
        assert_matches!(both.peek(), Some(Ok((1, "x"))));
    }

    #[test]
    fn zip_fails_fast() {
        let a: Deferred<u32> = Deferred::new();
        let b: Deferred<u32> = Deferred::new();
        let both = zip(&a, &b);
        b.fail(SharedError::new(anyhow::anyhow!("boom")));
        assert_matches!(both.peek(), Some(Err(_)));
    }

    #[test]
    fn zip_all_preserves_order() {
        let ds: Vec<Deferred<u32>> = (0..4).map(|_| Deferred::new()).collect();
        let all = zip_all(ds.clone());
        for (i, d) in ds.iter().enumerate().rev() {
            d.succeed(i as u32);
        }
        assert_matches!(all.peek(), Some(Ok(ref v)) if *v == vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn awaiting_a_deferred() {
        let d = Deferred::new();
        let awaited = d.clone();
        let handle = tokio::spawn(async move { awaited.await });
        tokio::task::yield_now().await;
        d.succeed(11);
        assert_matches!(handle.await.unwrap(), Ok(11));
    }

    #[tokio::test]
    async fn timeout_fires_on_pending() {
        let d: Deferred<u32> = Deferred::new();
        let timed = d.timeout(Duration::from_millis(20));
        let result = timed.await;
        let err = result.unwrap_err();
        assert!(err.downcast_ref::<TimeoutError>().is_some());
    }

    #[tokio::test]
    async fn timeout_with_default_resolves() {
        let d: Deferred<u32> = Deferred::new();
        let timed = d.timeout_or(Duration::from_millis(20), 99);
        assert_matches!(timed.await, Ok(99));
    }

    #[tokio::test]
    async fn zero_timeout_on_realized_passes_value_through() {
        let d = Deferred::ok(3);
        let timed = d.timeout(Duration::from_millis(0));
        assert_matches!(timed.await, Ok(3));
    }

    #[test]
    fn loop_fn_is_stack_safe_on_realized_chains() {
        let result = loop_fn(0u64, |n| {
            if n < 100_000 {
                Deferred::ok(Loop::Continue(n + 1))
            } else {
                Deferred::ok(Loop::Break(n))
            }
        });
        assert_matches!(result.peek(), Some(Ok(100_000)));
    }

    #[tokio::test]
    async fn loop_fn_crosses_async_boundaries() {
        let result = loop_fn(0u32, |n| {
            let step = Deferred::new();
            let resolver = step.clone();
            Scheduler::global().spawn(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                resolver.succeed(if n < 3 {
                    Loop::Continue(n + 1)
                } else {
                    Loop::Break(n)
                });
            });
            step
        });
        assert_matches!(result.await, Ok(3));
    }

    #[test]
    fn wait_blocks_until_realized() {
        let d = Deferred::new();
        let resolver = d.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            resolver.succeed(8);
        });
        assert_matches!(d.wait(), Ok(8));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn executor_runs_continuations_off_thread() {
        let d: Deferred<u32> = Deferred::with_executor(Handle::current());
        let (tx, rx) = tokio::sync::oneshot::channel();
        d.on_realized(move |result| {
            let _ = tx.send(result.unwrap());
        });
        d.succeed(6);
        assert_eq!(rx.await.unwrap(), 6);
    }
}
