/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Debug-only tracking of live stream nodes for introspection.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::Weak;

use crate::protocol::EventStream;
use crate::protocol::StreamRef;

struct Edge {
    id: u64,
    description: String,
    sink: Weak<dyn EventStream>,
}

/// Per-stream record of downstream connections.
///
/// Sinks are held weakly so an abandoned downstream pipeline stays
/// collectable; cleared handles are swept lazily whenever the node is read.
/// Every stream owns one node, registered into by [crate::connect].
pub struct GraphNode {
    next_id: AtomicU64,
    edges: Mutex<Vec<Edge>>,
}

impl GraphNode {
    /// An empty node.
    pub fn new() -> Self {
        GraphNode {
            next_id: AtomicU64::new(0),
            edges: Mutex::new(Vec::new()),
        }
    }

    /// Records an edge towards `sink`, returning an id for later removal.
    pub fn register(&self, description: String, sink: &StreamRef) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut edges = self.edges.lock().expect("lock poisoned");
        edges.push(Edge {
            id,
            description,
            sink: std::sync::Arc::downgrade(sink),
        });
        id
    }

    /// Removes the edge with the given id, if still present.
    pub fn unregister(&self, id: u64) {
        let mut edges = self.edges.lock().expect("lock poisoned");
        edges.retain(|edge| edge.id != id);
    }

    /// The live downstream edges as `(description, sink)` pairs. Edges whose
    /// sink has been dropped are removed.
    pub fn downstream(&self) -> Vec<(String, StreamRef)> {
        let mut edges = self.edges.lock().expect("lock poisoned");
        edges.retain(|edge| edge.sink.strong_count() > 0);
        edges
            .iter()
            .filter_map(|edge| {
                edge.sink
                    .upgrade()
                    .map(|sink| (edge.description.clone(), sink))
            })
            .collect()
    }

    /// The number of live downstream edges.
    pub fn edge_count(&self) -> usize {
        let mut edges = self.edges.lock().expect("lock poisoned");
        edges.retain(|edge| edge.sink.strong_count() > 0);
        edges.len()
    }
}

impl Default for GraphNode {
    fn default() -> Self {
        Self::new()
    }
}
