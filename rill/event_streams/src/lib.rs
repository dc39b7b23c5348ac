/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

#![deny(warnings, missing_docs, clippy::all, rustdoc::broken_intra_doc_links)]

//! Push-based, backpressure-aware event streams.
//!
//! A stream is a pair of capabilities: an [EventSink] accepting values via a
//! non-blocking put and an [EventSource] producing them via a non-blocking
//! take, both answering with [deferred::Deferred] values. [connect] moves
//! values from a source to a sink, and the combinators ([map], [filter],
//! [zip], [reductions], [batch], [throttle], ...) are small concurrent state
//! machines built from deferreds and streams, all preserving one invariant:
//! the next value is not taken until the previous one was acknowledged
//! downstream.
//!
//! ```
//! use event_streams::{collect, map, source_of};
//!
//! # let rt = tokio::runtime::Runtime::new().unwrap();
//! # rt.block_on(async {
//! let doubled = map(|v: u32| v * 2, source_of([1, 2, 3]));
//! assert_eq!(collect(doubled).await, vec![2, 4, 6]);
//! # });
//! ```

pub mod combinators;
pub mod connect;
pub mod flow;
pub mod graph;
pub mod operator;
pub mod protocol;
pub mod stream;

pub use crate::combinators::collect;
pub use crate::combinators::concat;
pub use crate::combinators::filter;
pub use crate::combinators::into_futures_stream;
pub use crate::combinators::into_futures_stream_timed;
pub use crate::combinators::lazily_partition_by;
pub use crate::combinators::map;
pub use crate::combinators::map2;
pub use crate::combinators::mapcat;
pub use crate::combinators::periodically;
pub use crate::combinators::realize_each;
pub use crate::combinators::reduce;
pub use crate::combinators::reduce1;
pub use crate::combinators::reductions;
pub use crate::combinators::reductions1;
pub use crate::combinators::source_of;
pub use crate::combinators::transform;
pub use crate::combinators::zip;
pub use crate::combinators::zip3;
pub use crate::connect::connect;
pub use crate::connect::connect_via;
pub use crate::connect::connect_via_proxy;
pub use crate::connect::consume;
pub use crate::connect::drain_into;
pub use crate::connect::CallbackSink;
pub use crate::connect::ConnectOptions;
pub use crate::flow::batch;
pub use crate::flow::batch_weighted;
pub use crate::flow::buffer;
pub use crate::flow::throttle;
pub use crate::flow::BufferedStream;
pub use crate::graph::GraphNode;
pub use crate::operator::Operator;
pub use crate::operator::OperatorFlow;
pub use crate::protocol::splice;
pub use crate::protocol::EventSink;
pub use crate::protocol::EventSource;
pub use crate::protocol::EventStream;
pub use crate::protocol::PutResult;
pub use crate::protocol::SinkProxy;
pub use crate::protocol::SinkRef;
pub use crate::protocol::SourceProxy;
pub use crate::protocol::SourceRef;
pub use crate::protocol::StreamRef;
pub use crate::protocol::TakeResult;
pub use crate::stream::stream;
pub use crate::stream::stream_with_capacity;
pub use crate::stream::DefaultStream;
pub use crate::stream::StreamBuilder;
