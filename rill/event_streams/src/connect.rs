/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Wiring sources into sinks.
//!
//! [connect] drives the generic transfer loop: take from the source, put
//! into the sink, and only take again once the put's deferred resolves. A
//! [CallbackSink] turns a per-message function into a sink whose returned
//! deferred gates that loop, which is the backpressure primitive every
//! combinator builds on.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use deferred::Deferred;
use deferred::Scheduler;
use tracing::warn;

use crate::graph::GraphNode;
use crate::protocol::EventSink;
use crate::protocol::EventStream;
use crate::protocol::LifecycleCallback;
use crate::protocol::PutResult;
use crate::protocol::SinkRef;
use crate::protocol::SourceRef;
use crate::protocol::StreamRef;
use crate::stream::DefaultStream;

/// Options for [connect], in builder style. The defaults propagate closure
/// downstream only.
#[derive(Clone)]
pub struct ConnectOptions {
    upstream: bool,
    downstream: bool,
    timeout: Option<Duration>,
    description: Option<String>,
}

impl ConnectOptions {
    /// The default options: `upstream` off, `downstream` on, no timeout.
    pub fn new() -> Self {
        ConnectOptions {
            upstream: false,
            downstream: true,
            timeout: None,
            description: None,
        }
    }

    /// When the sink closes, close the source even if it still has other
    /// downstream edges.
    pub fn upstream(mut self, upstream: bool) -> Self {
        self.upstream = upstream;
        self
    }

    /// When the source drains, close the sink.
    pub fn downstream(mut self, downstream: bool) -> Self {
        self.downstream = downstream;
        self
    }

    /// Per-message put timeout. A put that times out closes the sink, so a
    /// stalled consumer cannot block the rest of the topology.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// A label for the connection edge.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Wires `source` into `sink`.
///
/// The transfer runs on the timer pool and registers an edge on the
/// source's graph node for the duration of the connection. Closure and
/// drain propagate according to the options; a source-supplied custom
/// connector replaces the generic loop when present.
pub fn connect<T>(source: SourceRef<T>, sink: SinkRef<T>, options: ConnectOptions)
where
    T: Clone + Send + 'static,
{
    let description = options
        .description
        .clone()
        .unwrap_or_else(|| "connect".to_string());
    let sink_stream = Arc::clone(&sink).as_stream();
    let edge_id = source.node().register(description, &sink_stream);

    if let Some(custom) = source.connector(Arc::clone(&sink)) {
        let source = Arc::clone(&source);
        Scheduler::global().spawn(async move {
            custom.await;
            source.node().unregister(edge_id);
        });
        return;
    }

    Scheduler::global().spawn(transfer(source, sink, options, edge_id));
}

async fn transfer<T>(
    source: SourceRef<T>,
    sink: SinkRef<T>,
    options: ConnectOptions,
    edge_id: u64,
) where
    T: Clone + Send + 'static,
{
    loop {
        let message = match source.take().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                if options.downstream {
                    sink.close();
                }
                break;
            }
            Err(e) => {
                warn!(error = %e, "take failed, stopping transfer");
                break;
            }
        };

        let outcome = match options.timeout {
            Some(timeout) => sink
                .try_put(message, timeout)
                .await
                .unwrap_or(PutResult::Closed),
            None => match sink.put(message).await {
                Ok(true) => PutResult::Accepted,
                _ => PutResult::Closed,
            },
        };

        match outcome {
            PutResult::Accepted => {}
            PutResult::Closed => {
                if options.upstream || source.node().edge_count() <= 1 {
                    source.close();
                }
                break;
            }
            PutResult::TimedOut => {
                sink.close();
                break;
            }
        }
    }
    source.node().unregister(edge_id);
}

/// A sink that runs a function for every message.
///
/// The function's deferred is returned from [EventSink::put], so a transfer
/// loop feeding this sink will not take the next message until the previous
/// callback completed. An error from the function logs, closes the sink and
/// resolves the put to `false`.
pub struct CallbackSink<T> {
    #[allow(clippy::type_complexity)]
    callback: Mutex<Box<dyn FnMut(T) -> anyhow::Result<Deferred<bool>> + Send>>,
    closed: AtomicBool,
    on_closed: Mutex<Vec<LifecycleCallback>>,
    node: GraphNode,
}

impl<T> CallbackSink<T>
where
    T: Send + 'static,
{
    /// A sink invoking `callback` per message, optionally recording
    /// `downstream` as its topological successor.
    pub fn new<F>(callback: F, downstream: Option<StreamRef>) -> Self
    where
        F: FnMut(T) -> anyhow::Result<Deferred<bool>> + Send + 'static,
    {
        let node = GraphNode::new();
        if let Some(downstream) = downstream {
            node.register("callback".to_string(), &downstream);
        }
        CallbackSink {
            callback: Mutex::new(Box::new(callback)),
            closed: AtomicBool::new(false),
            on_closed: Mutex::new(Vec::new()),
            node,
        }
    }
}

impl<T> EventStream for CallbackSink<T>
where
    T: Send + 'static,
{
    fn description(&self) -> String {
        "callback".to_string()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.on_closed.lock().expect("lock poisoned"));
        for callback in callbacks {
            callback();
        }
    }

    fn node(&self) -> &GraphNode {
        &self.node
    }

    fn as_stream(self: Arc<Self>) -> StreamRef {
        self
    }
}

impl<T> EventSink<T> for CallbackSink<T>
where
    T: Send + 'static,
{
    fn put(&self, message: T) -> Deferred<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Deferred::ok(false);
        }
        let outcome = {
            let mut callback = self.callback.lock().expect("lock poisoned");
            (callback)(message)
        };
        match outcome {
            Ok(deferred) => deferred,
            Err(e) => {
                warn!(error = %e, "callback failed, closing sink");
                self.close();
                Deferred::ok(false)
            }
        }
    }

    // The timeout is not enforced: a callback put completes when the
    // callback's deferred does.
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
        self.closed.load(Ordering::SeqCst)
    }

    fn on_closed(&self, callback: LifecycleCallback) {
        if self.closed.load(Ordering::SeqCst) {
            callback();
            return;
        }
        self.on_closed.lock().expect("lock poisoned").push(callback);
    }
}

/// Wires `source` through `callback` towards the stream the callback writes
/// into. Closing `downstream` closes the intermediate callback sink, which
/// stops the transfer.
pub fn connect_via<T, U, F>(
    source: SourceRef<T>,
    callback: F,
    downstream: SinkRef<U>,
    options: ConnectOptions,
) where
    T: Clone + Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> anyhow::Result<Deferred<bool>> + Send + 'static,
{
    let sink = Arc::new(CallbackSink::new(
        callback,
        Some(Arc::clone(&downstream).as_stream()),
    ));
    {
        let sink = Arc::clone(&sink);
        downstream.on_closed(Box::new(move || sink.close()));
    }
    connect(source, sink, options);
}

/// Drains `source` into a synchronous consumer function, one message at a
/// time. The returned deferred resolves once the source is drained.
pub fn consume<T, F>(mut consumer: F, source: SourceRef<T>) -> Deferred<()>
where
    T: Clone + Send + 'static,
    F: FnMut(T) -> anyhow::Result<()> + Send + 'static,
{
    let done = Deferred::new();
    {
        let done = done.clone();
        source.on_drained(Box::new(move || {
            done.succeed(());
        }));
    }
    let sink = Arc::new(CallbackSink::new(
        move |message| {
            consumer(message)?;
            Ok(Deferred::ok(true))
        },
        None,
    ));
    connect(source, sink, ConnectOptions::new().description("consume"));
    done
}

/// Moves every message of `source` into `sink` without propagating closure
/// in either direction. The returned deferred resolves when the source is
/// drained.
pub fn drain_into<T>(source: SourceRef<T>, sink: SinkRef<T>) -> Deferred<()>
where
    T: Clone + Send + 'static,
{
    let done = Deferred::new();
    {
        let done = done.clone();
        source.on_drained(Box::new(move || {
            done.succeed(());
        }));
    }
    connect(
        source,
        sink,
        ConnectOptions::new()
            .downstream(false)
            .description("drain-into"),
    );
    done
}

/// Connects `source` into `proxy` and `proxy` into `sink`, with the first
/// leg exempt from downstream closure so sibling edges of the source cannot
/// tear the proxy down; the proxy closes only once the source drains.
pub fn connect_via_proxy<T, U>(
    source: SourceRef<T>,
    proxy: DefaultStream<T, U>,
    sink: SinkRef<U>,
    options: ConnectOptions,
) where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
{
    connect(
        Arc::clone(&source),
        proxy.sink(),
        ConnectOptions::new()
            .downstream(false)
            .description("connect-via-proxy"),
    );
    {
        let proxy = proxy.clone();
        source.on_drained(Box::new(move || proxy.close()));
    }
    connect(proxy.source(), sink, options);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;

    use super::*;
    use crate::protocol::EventSource;
    use crate::stream::stream;
    use crate::stream::stream_with_capacity;

    #[tokio::test]
    async fn transfer_moves_values_and_propagates_close() {
        let src = stream_with_capacity::<u32>(8);
        let dst = stream_with_capacity::<u32>(8);
        connect(src.source(), dst.sink(), ConnectOptions::new());
        src.put(1);
        src.put(2);
        src.close();
        assert_matches!(dst.take().await, Ok(Some(1)));
        assert_matches!(dst.take().await, Ok(Some(2)));
        assert_matches!(dst.take().await, Ok(None));
    }

    #[tokio::test]
    async fn downstream_false_keeps_sink_open() {
        let src = stream_with_capacity::<u32>(8);
        let dst = stream_with_capacity::<u32>(8);
        connect(
            src.source(),
            dst.sink(),
            ConnectOptions::new().downstream(false),
        );
        src.put(1);
        src.close();
        assert_matches!(dst.take().await, Ok(Some(1)));
        assert!(!dst.is_closed());
    }

    #[tokio::test]
    async fn closing_the_only_sink_closes_the_source() {
        let src = stream_with_capacity::<u32>(8);
        let dst = stream_with_capacity::<u32>(1);
        connect(src.source(), dst.sink(), ConnectOptions::new());
        src.put(1);
        assert_matches!(dst.take().await, Ok(Some(1)));
        dst.close();
        src.put(2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(src.is_closed());
    }

    #[tokio::test]
    async fn put_timeout_closes_the_sink() {
        let src = stream_with_capacity::<u32>(8);
        // Rendezvous sink with no consumer: the put can never complete.
        let dst = stream::<u32>();
        connect(
            src.source(),
            dst.sink(),
            ConnectOptions::new().timeout(Duration::from_millis(20)),
        );
        src.put(1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(dst.is_closed());
    }

    #[tokio::test]
    async fn edges_appear_and_disappear() {
        let src = stream_with_capacity::<u32>(8);
        let dst = stream_with_capacity::<u32>(8);
        connect(
            src.source(),
            dst.sink(),
            ConnectOptions::new().description("test-edge"),
        );
        let edges = src.source().downstream();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].0, "test-edge");
        src.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(src.source().downstream().len(), 0);
    }

    #[tokio::test]
    async fn callback_gates_the_next_take() {
        let src = stream_with_capacity::<u32>(8);
        let out = stream_with_capacity::<u32>(8);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let gate: Arc<Mutex<Option<Deferred<bool>>>> = Arc::new(Mutex::new(None));
        let sink = {
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            let gate = Arc::clone(&gate);
            Arc::new(CallbackSink::new(
                move |_message: u32| {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    let d = Deferred::new();
                    *gate.lock().unwrap() = Some(d.clone());
                    Ok(d)
                },
                Some(Arc::clone(&out.sink()).as_stream()),
            ))
        };
        connect(src.source(), sink, ConnectOptions::new());

        for n in 0..4 {
            src.put(n);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Only one callback may be outstanding until its deferred resolves.
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        for _ in 0..4 {
            let pending = gate.lock().unwrap().take();
            if let Some(d) = pending {
                in_flight.fetch_sub(1, Ordering::SeqCst);
                d.succeed(true);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callback_error_closes_the_sink() {
        let src = stream_with_capacity::<u32>(8);
        let sink: Arc<CallbackSink<u32>> = Arc::new(CallbackSink::new(
            |_| Err(anyhow::anyhow!("refused")),
            None,
        ));
        connect(src.source(), Arc::clone(&sink) as SinkRef<u32>, ConnectOptions::new());
        src.put(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.is_closed());
        // The source lost its only downstream and closed too.
        assert!(src.is_closed());
    }

    #[tokio::test]
    async fn consume_drains_in_order() {
        let src = stream_with_capacity::<u32>(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let done = {
            let seen = Arc::clone(&seen);
            consume(
                move |v| {
                    seen.lock().unwrap().push(v);
                    Ok(())
                },
                src.source(),
            )
        };
        for n in 0..5 {
            src.put(n);
        }
        src.close();
        assert_matches!(done.await, Ok(()));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn drain_into_leaves_the_sink_open() {
        let src = stream_with_capacity::<u32>(8);
        let dst = stream_with_capacity::<u32>(8);
        let done = drain_into(src.source(), dst.sink());
        src.put(1);
        src.close();
        assert_matches!(done.await, Ok(()));
        assert!(!dst.is_closed());
        assert_matches!(dst.take().await, Ok(Some(1)));
    }

    #[tokio::test]
    async fn connect_via_stops_when_downstream_closes() {
        let src = stream_with_capacity::<u32>(8);
        let out = stream_with_capacity::<u32>(1);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let out_sink = out.sink();
            let calls = Arc::clone(&calls);
            connect_via(
                src.source(),
                move |v| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(out_sink.put(v))
                },
                out.sink(),
                ConnectOptions::new(),
            );
        }
        src.put(1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_matches!(out.take().await, Ok(Some(1)));
        out.close();
        src.put(2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_close = calls.load(Ordering::SeqCst);
        src.put(3);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_close);
    }
}
