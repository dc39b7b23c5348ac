/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Flow control: weighted buffering, batching and throttling.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use deferred::Deferred;
use deferred::Scheduler;
use tokio::time::Instant;
use tracing::warn;

use crate::connect::connect;
use crate::connect::ConnectOptions;
use crate::graph::GraphNode;
use crate::protocol::EventSink;
use crate::protocol::EventSource;
use crate::protocol::EventStream;
use crate::protocol::LifecycleCallback;
use crate::protocol::PutResult;
use crate::protocol::SinkRef;
use crate::protocol::SourceRef;
use crate::protocol::StreamRef;
use crate::protocol::TakeResult;
use crate::stream::DefaultStream;
use crate::stream::StreamBuilder;

/// The metric used to weigh messages in a [BufferedStream].
pub type Metric<T> = Arc<dyn Fn(&T) -> u64 + Send + Sync>;

struct Gate {
    current: u64,
    last_put: Deferred<bool>,
}

/// A view over an unbounded inner stream with a soft limit on the total
/// metric weight of buffered messages.
///
/// Every put enqueues immediately; what the returned deferred conveys is
/// whether the buffer is within its limit. While the accumulated weight is
/// over the limit, puts share a single pending gate deferred that resolves
/// only once drainage brings the total back to or below the limit, which is
/// exactly the backpressure a connected upstream obeys.
pub struct BufferedStream<T> {
    inner: DefaultStream<T>,
    metric: Metric<T>,
    limit: u64,
    gate: Arc<Mutex<Gate>>,
}

impl<T> Clone for BufferedStream<T> {
    fn clone(&self) -> Self {
        BufferedStream {
            inner: self.inner.clone(),
            metric: Arc::clone(&self.metric),
            limit: self.limit,
            gate: Arc::clone(&self.gate),
        }
    }
}

impl<T> BufferedStream<T>
where
    T: Clone + Send + 'static,
{
    /// A buffered stream admitting roughly `limit` worth of `metric` before
    /// gating producers.
    pub fn new<M>(metric: M, limit: u64) -> Self
    where
        M: Fn(&T) -> u64 + Send + Sync + 'static,
    {
        BufferedStream {
            inner: StreamBuilder::new()
                .buffer_size(usize::MAX)
                .description("buffered-stream")
                .build::<T>(),
            metric: Arc::new(metric),
            limit,
            gate: Arc::new(Mutex::new(Gate {
                current: 0,
                last_put: Deferred::ok(true),
            })),
        }
    }

    /// This stream's sink face.
    pub fn sink(&self) -> SinkRef<T> {
        Arc::new(self.clone())
    }

    /// This stream's source face.
    pub fn source(&self) -> SourceRef<T> {
        Arc::new(self.clone())
    }

    fn credit(&self, weight: u64) {
        let resolve = {
            let mut gate = self.gate.lock().expect("lock poisoned");
            let was_over = gate.current > self.limit;
            gate.current = gate.current.saturating_sub(weight);
            if was_over && gate.current <= self.limit {
                Some(gate.last_put.clone())
            } else {
                None
            }
        };
        if let Some(last_put) = resolve {
            last_put.succeed(true);
        }
    }
}

impl<T> EventStream for BufferedStream<T>
where
    T: Clone + Send + 'static,
{
    fn description(&self) -> String {
        self.inner.description()
    }

    fn close(&self) {
        self.inner.close();
    }

    fn node(&self) -> &GraphNode {
        self.inner.node()
    }

    fn as_stream(self: Arc<Self>) -> StreamRef {
        self
    }
}

impl<T> EventSink<T> for BufferedStream<T>
where
    T: Clone + Send + 'static,
{
    fn put(&self, message: T) -> Deferred<bool> {
        let weight = (self.metric)(&message);
        let enqueued = self.inner.put(message);
        if let Some(Ok(false)) = enqueued.peek() {
            return enqueued;
        }
        let mut gate = self.gate.lock().expect("lock poisoned");
        let was_over = gate.current > self.limit;
        gate.current += weight;
        if gate.current > self.limit && !was_over {
            gate.last_put = Deferred::new();
        }
        gate.last_put.clone()
    }

    /// The timeout is not enforced on drainage: a put parked over the limit
    /// stays parked until consumers catch up.
    fn try_put(&self, message: T, _timeout: Duration) -> Deferred<PutResult> {
        self.put(message).map(|accepted| {
            if accepted {
                PutResult::Accepted
            } else {
                PutResult::Closed
            }
        })
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn on_closed(&self, callback: LifecycleCallback) {
        self.inner.on_closed(callback);
    }
}

impl<T> EventSource<T> for BufferedStream<T>
where
    T: Clone + Send + 'static,
{
    fn take(&self) -> Deferred<Option<T>> {
        let taken = self.inner.take();
        let this = self.clone();
        taken.on_realized(move |result| {
            if let Ok(Some(value)) = &result {
                this.credit((this.metric)(value));
            }
        });
        taken
    }

    fn try_take(&self, timeout: Duration) -> Deferred<TakeResult<T>> {
        let taken = self.inner.try_take(timeout);
        let this = self.clone();
        taken.on_realized(move |result| {
            if let Ok(TakeResult::Taken(value)) = &result {
                this.credit((this.metric)(value));
            }
        });
        taken
    }

    fn is_drained(&self) -> bool {
        self.inner.is_drained()
    }

    fn on_drained(&self, callback: LifecycleCallback) {
        self.inner.on_drained(callback);
    }
}

/// A source buffering up to `limit` worth of `metric` ahead of its
/// consumers, gating the upstream beyond that.
pub fn buffer<T, M>(metric: M, limit: u64, source: SourceRef<T>) -> SourceRef<T>
where
    T: Clone + Send + 'static,
    M: Fn(&T) -> u64 + Send + Sync + 'static,
{
    let buffered = BufferedStream::new(metric, limit);
    connect(
        source,
        buffered.sink(),
        ConnectOptions::new().description("buffer"),
    );
    buffered.source()
}

async fn batch_loop<T, M>(
    source: SourceRef<T>,
    out: DefaultStream<Vec<T>>,
    metric: M,
    max_weight: u64,
    max_latency: Option<Duration>,
) where
    T: Clone + Send + 'static,
    M: Fn(&T) -> u64 + Send + 'static,
{
    let out_sink = out.sink();
    'outer: loop {
        let first = match source.take().await {
            Ok(Some(message)) => message,
            _ => break,
        };
        let earliest = Instant::now();
        let mut weight = metric(&first);
        let mut pending = vec![first];
        let mut drained = false;
        while weight < max_weight {
            match max_latency {
                Some(latency) => {
                    let remaining = latency.saturating_sub(earliest.elapsed());
                    match source.try_take(remaining).await {
                        Ok(TakeResult::Taken(message)) => {
                            weight += metric(&message);
                            pending.push(message);
                        }
                        Ok(TakeResult::TimedOut) => break,
                        _ => {
                            drained = true;
                            break;
                        }
                    }
                }
                None => match source.take().await {
                    Ok(Some(message)) => {
                        weight += metric(&message);
                        pending.push(message);
                    }
                    _ => {
                        drained = true;
                        break;
                    }
                },
            }
        }
        if !out_sink.put(pending).await.unwrap_or(false) {
            source.close();
            break;
        }
        if drained {
            break 'outer;
        }
    }
    out.close();
}

/// A source of vectors of consecutive input messages, emitted once `max_size`
/// messages accumulate or, when `max_latency` is given, once that much time
/// passed since the earliest buffered message. A partial batch is emitted on
/// drain.
pub fn batch<T>(
    max_size: usize,
    max_latency: Option<Duration>,
    source: SourceRef<T>,
) -> SourceRef<Vec<T>>
where
    T: Clone + Send + 'static,
{
    batch_weighted(|_| 1, max_size as u64, max_latency, source)
}

/// Like [batch], but weighing messages with `metric` and closing each batch
/// once the accumulated weight reaches `max_weight`.
pub fn batch_weighted<T, M>(
    metric: M,
    max_weight: u64,
    max_latency: Option<Duration>,
    source: SourceRef<T>,
) -> SourceRef<Vec<T>>
where
    T: Clone + Send + 'static,
    M: Fn(&T) -> u64 + Send + 'static,
{
    assert!(max_weight > 0, "batch weight must be non-zero");
    let out = StreamBuilder::new().description("batch").build::<Vec<T>>();
    Scheduler::global().spawn(batch_loop(
        source,
        out.clone(),
        metric,
        max_weight,
        max_latency,
    ));
    out.source()
}

/// A source re-emitting the input at no more than `max_rate` messages per
/// second, with bursts bounded by `max_backlog` accumulated credits
/// (default: one second's worth). Closes when the input drains.
pub fn throttle<T>(max_rate: f64, max_backlog: Option<f64>, source: SourceRef<T>) -> SourceRef<T>
where
    T: Clone + Send + 'static,
{
    assert!(max_rate > 0.0, "rate must be positive");
    let period = clock_ext::hz(max_rate);
    let max_backlog = max_backlog.unwrap_or(max_rate).max(0.0);
    let out = StreamBuilder::new().description("throttle").build::<T>();
    let out_stream = out.clone();
    let out_sink = out.sink();
    Scheduler::global().spawn(async move {
        let mut backlog: f64 = 0.0;
        loop {
            let read_start = Instant::now();
            let message = match source.take().await {
                Ok(Some(message)) => message,
                _ => break,
            };
            if !out_sink.put(message).await.unwrap_or(false) {
                source.close();
                break;
            }
            let elapsed = read_start.elapsed();
            backlog = (backlog + elapsed.as_secs_f64() / period.as_secs_f64() - 1.0)
                .min(max_backlog);
            if backlog >= 1.0 {
                backlog -= 1.0;
                continue;
            }
            backlog = backlog.max(0.0);
            let pause = period.saturating_sub(elapsed);
            if pause > Duration::ZERO {
                if let Err(e) = Scheduler::global().sleep(pause).await {
                    warn!(error = %e, "throttle pause failed");
                    break;
                }
            }
        }
        out_stream.close();
    });
    out.source()
}
