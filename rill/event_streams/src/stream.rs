/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The base single-slot buffered stream implementation.

use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use deferred::Deferred;
use deferred::Scheduler;
use tokio::runtime::Handle;

use crate::graph::GraphNode;
use crate::operator::Identity;
use crate::operator::Operator;
use crate::operator::OperatorFlow;
use crate::protocol::EventSink;
use crate::protocol::EventSource;
use crate::protocol::EventStream;
use crate::protocol::LifecycleCallback;
use crate::protocol::PutResult;
use crate::protocol::SinkRef;
use crate::protocol::SourceRef;
use crate::protocol::StreamRef;
use crate::protocol::TakeResult;

/// Configuration for a [DefaultStream], in builder style.
///
/// ```
/// use event_streams::StreamBuilder;
///
/// let s = StreamBuilder::new()
///     .buffer_size(16)
///     .description("ingest")
///     .build::<u64>();
/// # drop(s);
/// ```
pub struct StreamBuilder {
    buffer_size: usize,
    permanent: bool,
    description: Option<String>,
    executor: Option<Handle>,
}

impl StreamBuilder {
    /// A builder for a rendezvous (zero-capacity), closeable stream.
    pub fn new() -> Self {
        StreamBuilder {
            buffer_size: 0,
            permanent: false,
            description: None,
            executor: None,
        }
    }

    /// Number of messages that may be enqueued before puts stop resolving
    /// immediately. Zero means every put waits for a matching take.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Makes [EventStream::close] a no-op.
    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    /// A human-readable description for the stream.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Continuations on deferreds produced by this stream are spawned onto
    /// the given runtime instead of running inline.
    pub fn executor(mut self, executor: Handle) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Builds a plain pass-through stream.
    pub fn build<T>(self) -> DefaultStream<T>
    where
        T: Clone + Send + 'static,
    {
        self.build_with_operator(Identity)
    }

    /// Builds a stream applying `operator` between put and take.
    pub fn build_with_operator<In, Out>(
        self,
        operator: impl Operator<In, Out> + 'static,
    ) -> DefaultStream<In, Out>
    where
        In: Send + 'static,
        Out: Clone + Send + 'static,
    {
        DefaultStream {
            inner: Arc::new(Inner {
                state: Mutex::new(StreamState {
                    operator: Box::new(operator),
                    buffer: VecDeque::new(),
                    pending_puts: VecDeque::new(),
                    takers: VecDeque::new(),
                    on_closed: Vec::new(),
                    on_drained: Vec::new(),
                    closed: false,
                    drained: false,
                }),
                node: GraphNode::new(),
                description: self.description.unwrap_or_else(|| "stream".to_string()),
                permanent: self.permanent,
                executor: self.executor,
                capacity: self.buffer_size,
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

impl Default for StreamBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A rendezvous stream: every put waits for a matching take.
pub fn stream<T>() -> DefaultStream<T>
where
    T: Clone + Send + 'static,
{
    StreamBuilder::new().build()
}

/// A stream buffering up to `buffer_size` messages.
pub fn stream_with_capacity<T>(buffer_size: usize) -> DefaultStream<T>
where
    T: Clone + Send + 'static,
{
    StreamBuilder::new().buffer_size(buffer_size).build()
}

struct PendingPut<Out> {
    put_id: u64,
    value: Out,
    ack: Option<Deferred<bool>>,
}

struct PendingTake<Out> {
    take_id: u64,
    cell: Deferred<Option<Out>>,
}

struct StreamState<In, Out> {
    operator: Box<dyn Operator<In, Out>>,
    buffer: VecDeque<Out>,
    pending_puts: VecDeque<PendingPut<Out>>,
    takers: VecDeque<PendingTake<Out>>,
    on_closed: Vec<LifecycleCallback>,
    on_drained: Vec<LifecycleCallback>,
    closed: bool,
    drained: bool,
}

struct Inner<In, Out> {
    state: Mutex<StreamState<In, Out>>,
    node: GraphNode,
    description: String,
    permanent: bool,
    executor: Option<Handle>,
    capacity: usize,
    next_id: AtomicU64,
}

/// Deferred resolutions and lifecycle callbacks accumulated under the state
/// lock and run after it is released, so user continuations never run with
/// the lock held.
struct Effects<Out> {
    taken: Vec<(Deferred<Option<Out>>, Option<Out>)>,
    acks: Vec<(Deferred<bool>, bool)>,
    callbacks: Vec<LifecycleCallback>,
}

impl<Out> Default for Effects<Out> {
    fn default() -> Self {
        Effects {
            taken: Vec::new(),
            acks: Vec::new(),
            callbacks: Vec::new(),
        }
    }
}

impl<Out: Clone + Send + 'static> Effects<Out> {
    fn run(self) {
        for (cell, value) in self.taken {
            cell.succeed(value);
        }
        for (ack, accepted) in self.acks {
            ack.succeed(accepted);
        }
        for callback in self.callbacks {
            callback();
        }
    }
}

/// The default buffered FIFO stream.
///
/// Handles are cheap to clone; [DefaultStream::sink] and
/// [DefaultStream::source] narrow a handle to one capability. Waiters are
/// FIFO on both sides: a take pairs with the oldest buffered or waiting
/// value, a put's acknowledgement pairs with the oldest waiting take.
pub struct DefaultStream<In, Out = In> {
    inner: Arc<Inner<In, Out>>,
}

impl<In, Out> Clone for DefaultStream<In, Out> {
    fn clone(&self) -> Self {
        DefaultStream {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<In, Out> DefaultStream<In, Out>
where
    In: Send + 'static,
    Out: Clone + Send + 'static,
{
    /// This stream's sink face.
    pub fn sink(&self) -> SinkRef<In> {
        Arc::new(self.clone())
    }

    /// This stream's source face.
    pub fn source(&self) -> SourceRef<Out> {
        Arc::new(self.clone())
    }

    fn deferred<X: Clone + Send + 'static>(&self) -> Deferred<X> {
        match &self.inner.executor {
            Some(executor) => Deferred::with_executor(executor.clone()),
            None => Deferred::new(),
        }
    }

    /// An already-realized deferred that still dispatches continuations on
    /// the stream's executor, when one is configured.
    fn resolved<X: Clone + Send + 'static>(&self, value: X) -> Deferred<X> {
        let cell = self.deferred();
        cell.succeed(value);
        cell
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Moves pending puts into freed buffer capacity.
    fn promote(&self, state: &mut StreamState<In, Out>, effects: &mut Effects<Out>) {
        while state.buffer.len() < self.inner.capacity {
            match state.pending_puts.pop_front() {
                Some(pending) => {
                    state.buffer.push_back(pending.value);
                    if let Some(ack) = pending.ack {
                        effects.acks.push((ack, true));
                    }
                }
                None => break,
            }
        }
    }

    fn drained_transition(&self, state: &mut StreamState<In, Out>, effects: &mut Effects<Out>) {
        if state.closed
            && !state.drained
            && state.buffer.is_empty()
            && state.pending_puts.is_empty()
        {
            state.drained = true;
            effects.callbacks.append(&mut state.on_drained);
        }
    }

    fn close_locked(&self, state: &mut StreamState<In, Out>, effects: &mut Effects<Out>) {
        if state.closed {
            return;
        }
        state.closed = true;
        // Waiting puts were never accepted; their values are discarded.
        for pending in state.pending_puts.drain(..) {
            if let Some(ack) = pending.ack {
                effects.acks.push((ack, false));
            }
        }
        for taker in state.takers.drain(..) {
            effects.taken.push((taker.cell, None));
        }
        effects.callbacks.append(&mut state.on_closed);
        self.drained_transition(state, effects);
    }

    /// Offers a message, returning the acknowledgement deferred and, when
    /// the put is parked in the waiting queue, its id for withdrawal.
    fn put_inner(&self, message: In) -> (Deferred<bool>, Option<u64>) {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.lock();
            if state.closed {
                return (self.resolved(false), None);
            }
            let mut outputs = Vec::new();
            let flow = state.operator.apply(message, &mut outputs);
            match flow {
                OperatorFlow::Terminate => {
                    // Terminal outputs bypass capacity so the stream can
                    // still drain; no further puts will be accepted.
                    for value in outputs {
                        match state.takers.pop_front() {
                            Some(taker) => effects.taken.push((taker.cell, Some(value))),
                            None => state.buffer.push_back(value),
                        }
                    }
                    self.close_locked(&mut state, &mut effects);
                    (self.resolved(true), None)
                }
                OperatorFlow::Continue => {
                    let count = outputs.len();
                    let put_id = self.next_id();
                    let mut gate: Option<Deferred<bool>> = None;
                    for (index, value) in outputs.into_iter().enumerate() {
                        if let Some(taker) = state.takers.pop_front() {
                            effects.taken.push((taker.cell, Some(value)));
                        } else if state.buffer.len() < self.inner.capacity {
                            state.buffer.push_back(value);
                        } else {
                            let ack = if index + 1 == count {
                                let cell = self.deferred();
                                gate = Some(cell.clone());
                                Some(cell)
                            } else {
                                None
                            };
                            state.pending_puts.push_back(PendingPut {
                                put_id,
                                value,
                                ack,
                            });
                        }
                    }
                    match gate {
                        Some(gate) => (gate, Some(put_id)),
                        None => (self.resolved(true), None),
                    }
                }
            }
        };
        effects.run();
        result
    }

    /// Requests a message, returning the take deferred and, when the take is
    /// parked in the waiting queue, its id for withdrawal.
    fn take_inner(&self) -> (Deferred<Option<Out>>, Option<u64>) {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.lock();
            if let Some(value) = state.buffer.pop_front() {
                self.promote(&mut state, &mut effects);
                self.drained_transition(&mut state, &mut effects);
                (self.resolved(Some(value)), None)
            } else if let Some(pending) = state.pending_puts.pop_front() {
                if let Some(ack) = pending.ack {
                    effects.acks.push((ack, true));
                }
                (self.resolved(Some(pending.value)), None)
            } else if state.closed {
                self.drained_transition(&mut state, &mut effects);
                (self.resolved(None), None)
            } else {
                let cell = self.deferred();
                let take_id = self.next_id();
                state.takers.push_back(PendingTake {
                    take_id,
                    cell: cell.clone(),
                });
                (cell, Some(take_id))
            }
        };
        effects.run();
        result
    }

    fn lock(&self) -> MutexGuard<'_, StreamState<In, Out>> {
        self.inner.state.lock().expect("lock poisoned")
    }
}

impl<In, Out> EventStream for DefaultStream<In, Out>
where
    In: Send + 'static,
    Out: Clone + Send + 'static,
{
    fn description(&self) -> String {
        self.inner.description.clone()
    }

    fn close(&self) {
        if self.inner.permanent {
            return;
        }
        let mut effects = Effects::default();
        {
            let mut state = self.lock();
            self.close_locked(&mut state, &mut effects);
        }
        effects.run();
    }

    fn node(&self) -> &GraphNode {
        &self.inner.node
    }

    fn as_stream(self: Arc<Self>) -> StreamRef {
        self
    }
}

impl<In, Out> EventSink<In> for DefaultStream<In, Out>
where
    In: Send + 'static,
    Out: Clone + Send + 'static,
{
    fn put(&self, message: In) -> Deferred<bool> {
        self.put_inner(message).0
    }

    fn try_put(&self, message: In, timeout: Duration) -> Deferred<PutResult> {
        let (gate, pending_id) = self.put_inner(message);
        let result: Deferred<PutResult> = self.deferred();
        {
            let result = result.clone();
            gate.on_realized(move |res| {
                let outcome = match res {
                    Ok(true) => PutResult::Accepted,
                    _ => PutResult::Closed,
                };
                result.resolve(Ok(outcome));
            });
        }
        if let Some(put_id) = pending_id {
            let stream = self.clone();
            let result = result.clone();
            Scheduler::global().spawn(async move {
                tokio::time::sleep(timeout).await;
                let withdrawn = {
                    let mut state = stream.lock();
                    let before = state.pending_puts.len();
                    state.pending_puts.retain(|pending| pending.put_id != put_id);
                    state.pending_puts.len() != before
                };
                if withdrawn {
                    result.resolve(Ok(PutResult::TimedOut));
                }
            });
        }
        result
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn on_closed(&self, callback: LifecycleCallback) {
        let run_now = {
            let mut state = self.lock();
            if state.closed {
                true
            } else {
                state.on_closed.push(callback);
                return;
            }
        };
        if run_now {
            callback();
        }
    }
}

impl<In, Out> EventSource<Out> for DefaultStream<In, Out>
where
    In: Send + 'static,
    Out: Clone + Send + 'static,
{
    fn take(&self) -> Deferred<Option<Out>> {
        self.take_inner().0
    }

    fn try_take(&self, timeout: Duration) -> Deferred<TakeResult<Out>> {
        let (cell, pending_id) = self.take_inner();
        let result: Deferred<TakeResult<Out>> = self.deferred();
        {
            let result = result.clone();
            cell.on_realized(move |res| {
                let outcome = match res {
                    Ok(Some(value)) => TakeResult::Taken(value),
                    _ => TakeResult::Drained,
                };
                result.resolve(Ok(outcome));
            });
        }
        if let Some(take_id) = pending_id {
            let stream = self.clone();
            let result = result.clone();
            Scheduler::global().spawn(async move {
                tokio::time::sleep(timeout).await;
                let withdrawn = {
                    let mut state = stream.lock();
                    let before = state.takers.len();
                    state.takers.retain(|taker| taker.take_id != take_id);
                    state.takers.len() != before
                };
                if withdrawn {
                    result.resolve(Ok(TakeResult::TimedOut));
                }
            });
        }
        result
    }

    fn is_drained(&self) -> bool {
        self.lock().drained
    }

    fn on_drained(&self, callback: LifecycleCallback) {
        let run_now = {
            let mut state = self.lock();
            if state.drained {
                true
            } else {
                state.on_drained.push(callback);
                return;
            }
        };
        if run_now {
            callback();
        }
    }
}
