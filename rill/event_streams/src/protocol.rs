/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The sink/source capability contract shared by every stream.
//!
//! A stream is a pair of capabilities: its sink side accepts values via a
//! non-blocking [EventSink::put] and its source side produces them via a
//! non-blocking [EventSource::take]. Both return [Deferred] values
//! immediately; the deferred is the only suspension point. Closed and
//! drained states are signals, not errors: a put into a closed sink resolves
//! to `false` and a take from a drained source resolves to `None`.

use std::sync::Arc;
use std::time::Duration;

use deferred::Deferred;
use futures::future::BoxFuture;

use crate::graph::GraphNode;

/// A type-erased handle to any stream.
pub type StreamRef = Arc<dyn EventStream>;

/// A shared handle to a sink of `T`.
pub type SinkRef<T> = Arc<dyn EventSink<T>>;

/// A shared handle to a source of `T`.
pub type SourceRef<T> = Arc<dyn EventSource<T>>;

/// A callback registered for a closed/drained transition.
pub type LifecycleCallback = Box<dyn FnOnce() + Send>;

/// Outcome of a timed put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// The value was accepted: buffered or consumed by a take.
    Accepted,
    /// The sink was closed at the time of the put.
    Closed,
    /// The put could not complete within the timeout and was withdrawn.
    TimedOut,
}

/// Outcome of a timed take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TakeResult<T> {
    /// A value was taken.
    Taken(T),
    /// The source was drained.
    Drained,
    /// No value arrived within the timeout; the take was withdrawn.
    TimedOut,
}

/// Operations shared by both faces of a stream.
pub trait EventStream: Send + Sync {
    /// A human-readable description of the stream.
    fn description(&self) -> String;

    /// Whether backpressure is realized by blocking a thread inside the
    /// stream rather than by deferred resolution.
    fn is_synchronous(&self) -> bool {
        false
    }

    /// Closes the stream. Idempotent; a no-op for permanent streams.
    fn close(&self);

    /// The stream's connection-graph node.
    fn node(&self) -> &GraphNode;

    /// The live downstream edges of this stream.
    fn downstream(&self) -> Vec<(String, StreamRef)> {
        self.node().downstream()
    }

    /// This handle as a type-erased stream.
    fn as_stream(self: Arc<Self>) -> StreamRef;
}

/// The accepting face of a stream.
pub trait EventSink<T>: EventStream {
    /// Offers a value. Returns immediately with a deferred resolving to
    /// `true` once the value is accepted, or `false` if the sink is closed.
    fn put(&self, message: T) -> Deferred<bool>;

    /// Like [EventSink::put], but withdrawn if not accepted within
    /// `timeout`.
    fn try_put(&self, message: T, timeout: Duration) -> Deferred<PutResult>;

    /// Whether the sink has been closed.
    fn is_closed(&self) -> bool;

    /// Registers a callback for the closed transition; runs immediately if
    /// already closed.
    fn on_closed(&self, callback: LifecycleCallback);
}

/// The producing face of a stream.
pub trait EventSource<T>: EventStream {
    /// Requests a value. Returns immediately with a deferred resolving to
    /// `Some(value)`, or `None` once the source is drained.
    fn take(&self) -> Deferred<Option<T>>;

    /// Like [EventSource::take], but withdrawn if no value arrives within
    /// `timeout`.
    fn try_take(&self, timeout: Duration) -> Deferred<TakeResult<T>>;

    /// Whether the source is closed with an empty buffer.
    fn is_drained(&self) -> bool;

    /// Registers a callback for the drained transition; runs immediately if
    /// already drained.
    fn on_drained(&self, callback: LifecycleCallback);

    /// An adapter-optimised transfer into `sink`, if this source provides
    /// one. [crate::connect] runs it in place of the generic transfer loop.
    fn connector(&self, sink: SinkRef<T>) -> Option<BoxFuture<'static, ()>> {
        let _ = sink;
        None
    }
}

/// Narrows a stream to its sink capability while forwarding the
/// stream-level operations.
pub struct SinkProxy<T> {
    inner: SinkRef<T>,
}

impl<T> SinkProxy<T> {
    /// Wraps a sink so only its sink face is reachable.
    pub fn new(inner: SinkRef<T>) -> Self {
        SinkProxy { inner }
    }
}

impl<T: Send + 'static> EventStream for SinkProxy<T> {
    fn description(&self) -> String {
        self.inner.description()
    }

    fn is_synchronous(&self) -> bool {
        self.inner.is_synchronous()
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

impl<T: Send + 'static> EventSink<T> for SinkProxy<T> {
    fn put(&self, message: T) -> Deferred<bool> {
        self.inner.put(message)
    }

    fn try_put(&self, message: T, timeout: Duration) -> Deferred<PutResult> {
        self.inner.try_put(message, timeout)
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn on_closed(&self, callback: LifecycleCallback) {
        self.inner.on_closed(callback);
    }
}

/// Narrows a stream to its source capability while forwarding the
/// stream-level operations.
pub struct SourceProxy<T> {
    inner: SourceRef<T>,
}

impl<T> SourceProxy<T> {
    /// Wraps a source so only its source face is reachable.
    pub fn new(inner: SourceRef<T>) -> Self {
        SourceProxy { inner }
    }
}

impl<T: Send + 'static> EventStream for SourceProxy<T> {
    fn description(&self) -> String {
        self.inner.description()
    }

    fn is_synchronous(&self) -> bool {
        self.inner.is_synchronous()
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

impl<T: Send + 'static> EventSource<T> for SourceProxy<T> {
    fn take(&self) -> Deferred<Option<T>> {
        self.inner.take()
    }

    fn try_take(&self, timeout: Duration) -> Deferred<TakeResult<T>> {
        self.inner.try_take(timeout)
    }

    fn is_drained(&self) -> bool {
        self.inner.is_drained()
    }

    fn on_drained(&self, callback: LifecycleCallback) {
        self.inner.on_drained(callback);
    }

    fn connector(&self, sink: SinkRef<T>) -> Option<BoxFuture<'static, ()>> {
        self.inner.connector(sink)
    }
}

/// Two stream halves packaged as one stream: puts go to `sink`, takes come
/// from `source`, `close` closes both and `is_synchronous` is the
/// disjunction.
pub struct SplicedStream<In, Out> {
    sink: SinkRef<In>,
    source: SourceRef<Out>,
}

/// Packages a sink half and a source half as a single stream.
pub fn splice<In, Out>(sink: SinkRef<In>, source: SourceRef<Out>) -> SplicedStream<In, Out> {
    SplicedStream { sink, source }
}

impl<In: Send + 'static, Out: Send + 'static> EventStream for SplicedStream<In, Out> {
    fn description(&self) -> String {
        format!(
            "splice({}, {})",
            self.sink.description(),
            self.source.description()
        )
    }

    fn is_synchronous(&self) -> bool {
        self.sink.is_synchronous() || self.source.is_synchronous()
    }

    fn close(&self) {
        self.sink.close();
        self.source.close();
    }

    fn node(&self) -> &GraphNode {
        self.source.node()
    }

    fn as_stream(self: Arc<Self>) -> StreamRef {
        self
    }
}

impl<In: Send + 'static, Out: Send + 'static> EventSink<In> for SplicedStream<In, Out> {
    fn put(&self, message: In) -> Deferred<bool> {
        self.sink.put(message)
    }

    fn try_put(&self, message: In, timeout: Duration) -> Deferred<PutResult> {
        self.sink.try_put(message, timeout)
    }

    fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }

    fn on_closed(&self, callback: LifecycleCallback) {
        self.sink.on_closed(callback);
    }
}

impl<In: Send + 'static, Out: Send + 'static> EventSource<Out> for SplicedStream<In, Out> {
    fn take(&self) -> Deferred<Option<Out>> {
        self.source.take()
    }

    fn try_take(&self, timeout: Duration) -> Deferred<TakeResult<Out>> {
        self.source.try_take(timeout)
    }

    fn is_drained(&self) -> bool {
        self.source.is_drained()
    }

    fn on_drained(&self, callback: LifecycleCallback) {
        self.source.on_drained(callback);
    }

    fn connector(&self, sink: SinkRef<Out>) -> Option<BoxFuture<'static, ()>> {
        self.source.connector(sink)
    }
}
