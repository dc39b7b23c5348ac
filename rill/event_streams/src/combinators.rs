/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The combinator algebra over sources.
//!
//! Every combinator builds an output stream and wires the input into it so
//! that at most one transformed message is in flight at a time: the next
//! take happens only once the previous put into the output has been
//! acknowledged.

use std::time::Duration;

use deferred::Deferred;
use deferred::Scheduler;
use futures::Stream;
use tokio::time::Instant;
use tracing::warn;

use crate::connect::connect;
use crate::connect::connect_via;
use crate::connect::ConnectOptions;
use crate::operator::Operator;
use crate::protocol::EventSink;
use crate::protocol::EventStream;
use crate::protocol::SourceRef;
use crate::protocol::TakeResult;
use crate::stream::stream;
use crate::stream::stream_with_capacity;
use crate::stream::StreamBuilder;

/// A source of `f` applied to every message.
pub fn map<T, U, F>(mut f: F, source: SourceRef<T>) -> SourceRef<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: FnMut(T) -> U + Send + 'static,
{
    let out = StreamBuilder::new().description("map").build::<U>();
    let out_sink = out.sink();
    connect_via(
        source,
        move |message| Ok(out_sink.put(f(message))),
        out.sink(),
        ConnectOptions::new().description("map"),
    );
    out.source()
}

/// A source of the messages passing a predicate.
pub fn filter<T, F>(mut predicate: F, source: SourceRef<T>) -> SourceRef<T>
where
    T: Clone + Send + 'static,
    F: FnMut(&T) -> bool + Send + 'static,
{
    let out = StreamBuilder::new().description("filter").build::<T>();
    let out_sink = out.sink();
    connect_via(
        source,
        move |message| {
            if predicate(&message) {
                Ok(out_sink.put(message))
            } else {
                Ok(Deferred::ok(true))
            }
        },
        out.sink(),
        ConnectOptions::new().description("filter"),
    );
    out.source()
}

/// A source of every element of every collection `f` produces, in order.
pub fn mapcat<T, U, I, F>(mut f: F, source: SourceRef<T>) -> SourceRef<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    I: IntoIterator<Item = U>,
    F: FnMut(T) -> I + Send + 'static,
{
    let out = StreamBuilder::new().description("mapcat").build::<U>();
    let out_sink = out.sink();
    connect_via(
        source,
        move |message| {
            let mut last = Deferred::ok(true);
            for item in f(message) {
                last = out_sink.put(item);
            }
            Ok(last)
        },
        out.sink(),
        ConnectOptions::new().description("mapcat"),
    );
    out.source()
}

/// A source pairing messages of two sources positionally. Once either input
/// drains, the output closes after the last complete pair.
pub fn zip<A, B>(a: SourceRef<A>, b: SourceRef<B>) -> SourceRef<(A, B)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    let out = StreamBuilder::new().description("zip").build::<(A, B)>();
    let out_stream = out.clone();
    let out_sink = out.sink();
    Scheduler::global().spawn(async move {
        loop {
            let next_a = a.take();
            let next_b = b.take();
            match deferred::zip(&next_a, &next_b).await {
                Ok((Some(x), Some(y))) => {
                    if !out_sink.put((x, y)).await.unwrap_or(false) {
                        break;
                    }
                }
                _ => break,
            }
        }
        out_stream.close();
    });
    out.source()
}

/// Like [zip], over three sources.
pub fn zip3<A, B, C>(a: SourceRef<A>, b: SourceRef<B>, c: SourceRef<C>) -> SourceRef<(A, B, C)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    C: Clone + Send + 'static,
{
    map(|((a, b), c)| (a, b, c), zip(zip(a, b), c))
}

/// Maps a binary function over two sources zipped positionally.
pub fn map2<A, B, U, F>(mut f: F, a: SourceRef<A>, b: SourceRef<B>) -> SourceRef<U>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: FnMut(A, B) -> U + Send + 'static,
{
    map(move |(a, b)| f(a, b), zip(a, b))
}

/// A source of the running accumulation of `f` over the input, starting
/// from (and first emitting) `init`. An error from `f` logs and closes both
/// streams.
pub fn reductions<T, A, F>(mut f: F, init: A, source: SourceRef<T>) -> SourceRef<A>
where
    T: Clone + Send + 'static,
    A: Clone + Send + 'static,
    F: FnMut(A, T) -> anyhow::Result<A> + Send + 'static,
{
    let out = StreamBuilder::new().description("reductions").build::<A>();
    let out_stream = out.clone();
    let out_sink = out.sink();
    Scheduler::global().spawn(async move {
        let mut acc = init;
        if !out_sink.put(acc.clone()).await.unwrap_or(false) {
            source.close();
            out_stream.close();
            return;
        }
        while let Ok(Some(message)) = source.take().await {
            acc = match f(acc, message) {
                Ok(next) => next,
                Err(e) => {
                    warn!(error = %e, "reduction failed, closing");
                    source.close();
                    break;
                }
            };
            if !out_sink.put(acc.clone()).await.unwrap_or(false) {
                source.close();
                break;
            }
        }
        out_stream.close();
    });
    out.source()
}

/// The final accumulation of `f` over the input.
///
/// An error from `f` resolves the returned deferred to the accumulator at
/// the point of failure rather than failing it; callers that need to
/// distinguish should track failure inside `f`.
pub fn reduce<T, A, F>(mut f: F, init: A, source: SourceRef<T>) -> Deferred<A>
where
    T: Clone + Send + 'static,
    A: Clone + Send + 'static,
    F: FnMut(A, T) -> anyhow::Result<A> + Send + 'static,
{
    let result = Deferred::new();
    let resolver = result.clone();
    Scheduler::global().spawn(async move {
        let mut acc = init;
        while let Ok(Some(message)) = source.take().await {
            match f(acc.clone(), message) {
                Ok(next) => acc = next,
                Err(e) => {
                    warn!(error = %e, "reduction failed, resolving to last accumulator");
                    source.close();
                    break;
                }
            }
        }
        resolver.succeed(acc);
    });
    result
}

/// Like [reductions], but seeded by the first input element, which is also
/// the first emission. An empty input yields an empty output.
pub fn reductions1<T, F>(mut f: F, source: SourceRef<T>) -> SourceRef<T>
where
    T: Clone + Send + 'static,
    F: FnMut(T, T) -> anyhow::Result<T> + Send + 'static,
{
    let out = StreamBuilder::new().description("reductions").build::<T>();
    let out_stream = out.clone();
    let out_sink = out.sink();
    Scheduler::global().spawn(async move {
        let mut acc = match source.take().await {
            Ok(Some(first)) => first,
            _ => {
                out_stream.close();
                return;
            }
        };
        if !out_sink.put(acc.clone()).await.unwrap_or(false) {
            source.close();
            out_stream.close();
            return;
        }
        while let Ok(Some(message)) = source.take().await {
            acc = match f(acc, message) {
                Ok(next) => next,
                Err(e) => {
                    warn!(error = %e, "reduction failed, closing");
                    source.close();
                    break;
                }
            };
            if !out_sink.put(acc.clone()).await.unwrap_or(false) {
                source.close();
                break;
            }
        }
        out_stream.close();
    });
    out.source()
}

/// Like [reduce], but seeded by the first input element. Resolves to `None`
/// for an empty input.
pub fn reduce1<T, F>(mut f: F, source: SourceRef<T>) -> Deferred<Option<T>>
where
    T: Clone + Send + 'static,
    F: FnMut(T, T) -> anyhow::Result<T> + Send + 'static,
{
    let result = Deferred::new();
    let resolver = result.clone();
    Scheduler::global().spawn(async move {
        let mut acc = match source.take().await {
            Ok(Some(first)) => first,
            _ => {
                resolver.succeed(None);
                return;
            }
        };
        while let Ok(Some(message)) = source.take().await {
            match f(acc.clone(), message) {
                Ok(next) => acc = next,
                Err(e) => {
                    warn!(error = %e, "reduction failed, resolving to last accumulator");
                    source.close();
                    break;
                }
            }
        }
        resolver.succeed(Some(acc));
    });
    result
}

/// A source applying `operator` to the input, buffered to `buffer_size`.
pub fn transform<In, Out>(
    operator: impl Operator<In, Out> + 'static,
    buffer_size: usize,
    source: SourceRef<In>,
) -> SourceRef<Out>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + 'static,
{
    let out = StreamBuilder::new()
        .buffer_size(buffer_size)
        .description("transform")
        .build_with_operator(operator);
    connect(
        source,
        out.sink(),
        ConnectOptions::new().description("transform"),
    );
    out.source()
}

/// Unwraps a source of deferreds, emitting each realized value in order. A
/// deferred that fails logs and closes the output.
pub fn realize_each<T>(source: SourceRef<Deferred<T>>) -> SourceRef<T>
where
    T: Clone + Send + 'static,
{
    let out = StreamBuilder::new().description("realize-each").build::<T>();
    let out_stream = out.clone();
    let out_sink = out.sink();
    connect_via(
        source,
        move |message: Deferred<T>| {
            let gate = Deferred::new();
            let out_stream = out_stream.clone();
            let out_sink = out_sink.clone();
            let resolver = gate.clone();
            message.on_realized(move |result| match result {
                Ok(value) => {
                    out_sink.put(value).on_realized(move |accepted| {
                        resolver.resolve(accepted);
                    });
                }
                Err(e) => {
                    warn!(error = %e, "deferred message failed, closing");
                    out_stream.close();
                    resolver.succeed(false);
                }
            });
            Ok(gate)
        },
        out.sink(),
        ConnectOptions::new().description("realize-each"),
    );
    out.source()
}

/// Flattens a source of sources, exhausting each inner source before taking
/// the next. A rejected put on the output closes the outer source.
pub fn concat<T>(sources: SourceRef<SourceRef<T>>) -> SourceRef<T>
where
    T: Clone + Send + 'static,
{
    let out = StreamBuilder::new().description("concat").build::<T>();
    let out_stream = out.clone();
    let out_sink = out.sink();
    Scheduler::global().spawn(async move {
        'outer: loop {
            let inner = match sources.take().await {
                Ok(Some(inner)) => inner,
                _ => break,
            };
            while let Ok(Some(message)) = inner.take().await {
                if !out_sink.put(message).await.unwrap_or(false) {
                    sources.close();
                    break 'outer;
                }
            }
        }
        out_stream.close();
    });
    out.source()
}

/// Splits a source into a source of consecutive sub-sources sharing a key.
///
/// The next sub-source is not offered until the consumer advances the outer
/// take, and each sub-source hands values over by rendezvous, so no
/// partition is read ahead of its consumer.
pub fn lazily_partition_by<T, K, F>(mut f: F, source: SourceRef<T>) -> SourceRef<SourceRef<T>>
where
    T: Clone + Send + 'static,
    K: PartialEq + Send + 'static,
    F: FnMut(&T) -> K + Send + 'static,
{
    let out = StreamBuilder::new()
        .description("partition-by")
        .build::<SourceRef<T>>();
    let out_stream = out.clone();
    let out_sink = out.sink();
    Scheduler::global().spawn(async move {
        let mut current: Option<(K, crate::stream::DefaultStream<T>)> = None;
        loop {
            let message = match source.take().await {
                Ok(Some(message)) => message,
                _ => break,
            };
            let key = f(&message);
            let changed = match &current {
                Some((previous, _)) => *previous != key,
                None => true,
            };
            if changed {
                if let Some((_, partition)) = current.take() {
                    partition.close();
                }
                let partition = stream::<T>();
                if !out_sink.put(partition.source()).await.unwrap_or(false) {
                    source.close();
                    break;
                }
                current = Some((key, partition));
            }
            if let Some((_, partition)) = &current {
                // A closed partition swallows the rest of its run.
                let _ = partition.put(message).await;
            }
        }
        if let Some((_, partition)) = current.take() {
            partition.close();
        }
        out_stream.close();
    });
    out.source()
}

/// Bridges a source into a [futures::Stream], terminating once the source
/// drains.
pub fn into_futures_stream<T>(source: SourceRef<T>) -> impl Stream<Item = T>
where
    T: Clone + Send + 'static,
{
    futures::stream::unfold(source, |source| async move {
        match source.take().await {
            Ok(Some(value)) => Some((value, source)),
            _ => None,
        }
    })
}

/// Like [into_futures_stream], but also terminating once any single take
/// waits longer than `timeout`.
pub fn into_futures_stream_timed<T>(
    source: SourceRef<T>,
    timeout: Duration,
) -> impl Stream<Item = T>
where
    T: Clone + Send + 'static,
{
    futures::stream::unfold(source, move |source| async move {
        match source.try_take(timeout).await {
            Ok(TakeResult::Taken(value)) => Some((value, source)),
            _ => None,
        }
    })
}

/// A source emitting `f()` on every period boundary, starting after
/// `initial_delay` (default zero).
///
/// The output holds a single slot; while a slow consumer blocks it, ticks
/// are skipped and emission realigns to the next period boundary once the
/// put completes. Closing the output stops the task, as does an error from
/// `f`, which is logged.
pub fn periodically<T, F>(
    period: Duration,
    initial_delay: Option<Duration>,
    mut f: F,
) -> SourceRef<T>
where
    T: Clone + Send + 'static,
    F: FnMut() -> anyhow::Result<T> + Send + 'static,
{
    assert!(period > Duration::ZERO, "period must be non-zero");
    let out = StreamBuilder::new()
        .buffer_size(1)
        .description("periodically")
        .build::<T>();
    let out_stream = out.clone();
    let out_sink = out.sink();
    Scheduler::global().spawn(async move {
        tokio::time::sleep(initial_delay.unwrap_or(Duration::ZERO)).await;
        let start = Instant::now();
        loop {
            let value = match f() {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "periodic emission failed, closing");
                    break;
                }
            };
            if !out_sink.put(value).await.unwrap_or(false) {
                break;
            }
            // Land the next emission on a period boundary.
            let elapsed = start.elapsed().as_nanos();
            let period_nanos = period.as_nanos();
            let until_boundary = period_nanos - (elapsed % period_nanos);
            tokio::time::sleep(Duration::from_nanos(until_boundary as u64)).await;
        }
        out_stream.close();
    });
    out.source()
}

/// Collects a source to completion into a vector. Test and interop helper.
pub async fn collect<T>(source: SourceRef<T>) -> Vec<T>
where
    T: Clone + Send + 'static,
{
    let mut out = Vec::new();
    while let Ok(Some(value)) = source.take().await {
        out.push(value);
    }
    out
}

/// A closed stream preloaded with the given messages. Test and interop
/// helper.
pub fn source_of<T, I>(values: I) -> SourceRef<T>
where
    T: Clone + Send + 'static,
    I: IntoIterator<Item = T>,
{
    let values: Vec<T> = values.into_iter().collect();
    let s = stream_with_capacity::<T>(values.len().max(1));
    for value in values {
        s.put(value);
    }
    s.close();
    s.source()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use futures::StreamExt;

    use super::*;
    use crate::operator::DedupeOperator;

    #[tokio::test]
    async fn map_transforms_in_order() {
        let incremented = map(|v: u32| v + 1, source_of([0, 1, 2]));
        assert_eq!(collect(incremented).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn filter_keeps_matching() {
        let evens = filter(|v: &u32| v % 2 == 0, source_of(0..10));
        assert_eq!(collect(evens).await, vec![0, 2, 4, 6, 8]);
    }

    #[tokio::test]
    async fn mapcat_flattens() {
        let repeated = mapcat(|v: u32| vec![v; v as usize], source_of([1, 2, 3]));
        assert_eq!(collect(repeated).await, vec![1, 2, 2, 3, 3, 3]);
    }

    #[tokio::test]
    async fn zip_pairs_until_shorter_drains() {
        let zipped = zip(source_of([1u32, 2, 3]), source_of(["a", "b"]));
        assert_eq!(collect(zipped).await, vec![(1, "a"), (2, "b")]);
    }

    #[tokio::test]
    async fn zip3_triples() {
        let zipped = zip3(source_of([1u32, 2]), source_of(["a", "b"]), source_of([true, false]));
        assert_eq!(
            collect(zipped).await,
            vec![(1, "a", true), (2, "b", false)]
        );
    }

    #[tokio::test]
    async fn map2_applies_pairwise() {
        let sums = map2(|a: u32, b: u32| a + b, source_of([1, 2, 3]), source_of([10, 20, 30]));
        assert_eq!(collect(sums).await, vec![11, 22, 33]);
    }

    #[tokio::test]
    async fn reductions_emits_the_running_total() {
        let totals = reductions(|acc: u32, v: u32| Ok(acc + v), 0, source_of([1, 2, 3]));
        assert_eq!(collect(totals).await, vec![0, 1, 3, 6]);
    }

    #[tokio::test]
    async fn reduce_resolves_to_the_final_total() {
        let total = reduce(|acc: u32, v: u32| Ok(acc + v), 0, source_of([1, 2, 3]));
        assert_matches!(total.await, Ok(6));
    }

    #[tokio::test]
    async fn reduce_error_resolves_to_the_last_accumulator() {
        let total = reduce(
            |acc: u32, v: u32| {
                if v == 3 {
                    Err(anyhow::anyhow!("boom"))
                } else {
                    Ok(acc + v)
                }
            },
            0,
            source_of([1, 2, 3, 4]),
        );
        assert_matches!(total.await, Ok(3));
    }

    #[tokio::test]
    async fn unseeded_reductions_start_with_the_first_element() {
        let totals = reductions1(|acc: u32, v: u32| Ok(acc + v), source_of([1, 2, 3]));
        assert_eq!(collect(totals).await, vec![1, 3, 6]);
    }

    #[tokio::test]
    async fn unseeded_reduce_of_empty_input_is_none() {
        let total = reduce1(|acc: u32, v: u32| Ok(acc + v), source_of([]));
        assert_matches!(total.await, Ok(None));
        let total = reduce1(|acc: u32, v: u32| Ok(acc + v), source_of([4, 5]));
        assert_matches!(total.await, Ok(Some(9)));
    }

    #[tokio::test]
    async fn transform_applies_the_operator() {
        let deduped = transform(DedupeOperator::new(), 8, source_of([1u32, 1, 2, 2, 2, 3]));
        assert_eq!(collect(deduped).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn realize_each_unwraps_in_order() {
        let slow = Deferred::new();
        let items = source_of([slow.clone(), Deferred::ok(2u32)]);
        let realized = realize_each(items);
        let resolver = slow.clone();
        Scheduler::global().spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resolver.succeed(1);
        });
        assert_eq!(collect(realized).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn realize_each_closes_on_error() {
        let items = source_of([
            Deferred::ok(1u32),
            Deferred::err(deferred::SharedError::from(anyhow::anyhow!("bad"))),
            Deferred::ok(3u32),
        ]);
        let realized = realize_each(items);
        assert_eq!(collect(realized).await, vec![1]);
    }

    #[tokio::test]
    async fn concat_exhausts_each_inner_source() {
        let flattened = concat(source_of([
            source_of([1u32, 2]),
            source_of([3]),
            source_of([]),
            source_of([4, 5]),
        ]));
        assert_eq!(collect(flattened).await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn partitions_concat_back_to_the_input() {
        let input = vec![1u32, 1, 2, 2, 2, 3, 1, 1];
        let partitions = lazily_partition_by(|v: &u32| *v, source_of(input.clone()));
        let roundtrip = concat(partitions);
        assert_eq!(collect(roundtrip).await, input);
    }

    #[tokio::test]
    async fn partition_keys_split_runs() {
        let partitions = lazily_partition_by(|v: &u32| v / 10, source_of([1u32, 2, 11, 12, 21]));
        let mut groups = Vec::new();
        let mut outer = Box::pin(into_futures_stream(partitions));
        while let Some(partition) = outer.next().await {
            groups.push(collect(partition).await);
        }
        assert_eq!(groups, vec![vec![1, 2], vec![11, 12], vec![21]]);
    }

    #[tokio::test]
    async fn futures_stream_bridge_terminates() {
        let collected: Vec<u32> = into_futures_stream(source_of([1, 2, 3])).collect().await;
        assert_eq!(collected, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn timed_bridge_stops_on_silence() {
        let s = crate::stream::stream_with_capacity::<u32>(4);
        s.put(1);
        let collected: Vec<u32> =
            into_futures_stream_timed(s.source(), Duration::from_millis(30))
                .collect()
                .await;
        assert_eq!(collected, vec![1]);
    }

    #[tokio::test]
    async fn periodically_emits_increasing_values() {
        let counter = Arc::new(AtomicU64::new(0));
        let ticker = Arc::clone(&counter);
        let ticks = periodically(Duration::from_millis(20), None, move || {
            Ok(ticker.fetch_add(1, Ordering::SeqCst))
        });
        let mut seen = Vec::new();
        for _ in 0..3 {
            match ticks.take().await {
                Ok(Some(v)) => seen.push(v),
                other => panic!("unexpected take outcome: {:?}", other),
            }
            tokio::time::sleep(Duration::from_millis(45)).await;
        }
        ticks.close();
        assert_eq!(seen.len(), 3);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn periodically_stops_after_error() {
        let calls = Arc::new(AtomicU64::new(0));
        let witness = Arc::clone(&calls);
        let ticks: SourceRef<u64> = periodically(Duration::from_millis(10), None, move || {
            witness.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("tick failed"))
        });
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ticks.is_drained());
    }
}
