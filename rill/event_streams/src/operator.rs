/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Stateful per-message operators applied inside a stream's put path.
//!
//! An operator may expand one input into several outputs, contract it to
//! none, or terminate the stream, which makes it the moral equivalent of a
//! stateful reducer transformation.

/// Whether the stream should keep accepting input after this step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorFlow {
    /// Keep accepting messages.
    Continue,
    /// Close the stream once this step's outputs are delivered.
    Terminate,
}

/// A stateful step invoked for every message put into a stream.
///
/// Outputs are pushed onto `out`; pushing none is a valid contraction and
/// the corresponding put still succeeds.
pub trait Operator<In, Out>: Send {
    /// Process one input message.
    fn apply(&mut self, input: In, out: &mut Vec<Out>) -> OperatorFlow;
}

/// Passes every message through untouched.
pub struct Identity;

impl<T> Operator<T, T> for Identity {
    fn apply(&mut self, input: T, out: &mut Vec<T>) -> OperatorFlow {
        out.push(input);
        OperatorFlow::Continue
    }
}

/// Applies a function to every message.
pub struct MapOperator<F>(pub F);

impl<In, Out, F> Operator<In, Out> for MapOperator<F>
where
    F: FnMut(In) -> Out + Send,
{
    fn apply(&mut self, input: In, out: &mut Vec<Out>) -> OperatorFlow {
        out.push((self.0)(input));
        OperatorFlow::Continue
    }
}

/// Drops messages failing a predicate.
pub struct FilterOperator<F>(pub F);

impl<T, F> Operator<T, T> for FilterOperator<F>
where
    F: FnMut(&T) -> bool + Send,
{
    fn apply(&mut self, input: T, out: &mut Vec<T>) -> OperatorFlow {
        if (self.0)(&input) {
            out.push(input);
        }
        OperatorFlow::Continue
    }
}

/// Passes through the first `n` messages, then terminates the stream.
pub struct TakeOperator {
    remaining: usize,
}

impl TakeOperator {
    /// An operator passing through at most `n` messages.
    pub fn new(n: usize) -> Self {
        TakeOperator { remaining: n }
    }
}

impl<T> Operator<T, T> for TakeOperator {
    fn apply(&mut self, input: T, out: &mut Vec<T>) -> OperatorFlow {
        if self.remaining == 0 {
            return OperatorFlow::Terminate;
        }
        out.push(input);
        self.remaining -= 1;
        if self.remaining == 0 {
            OperatorFlow::Terminate
        } else {
            OperatorFlow::Continue
        }
    }
}

/// Drops messages equal to their immediate predecessor.
pub struct DedupeOperator<T> {
    last: Option<T>,
}

impl<T> DedupeOperator<T> {
    /// A deduplicating operator with no previous message.
    pub fn new() -> Self {
        DedupeOperator { last: None }
    }
}

impl<T> Default for DedupeOperator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Operator<T, T> for DedupeOperator<T>
where
    T: Clone + PartialEq + Send,
{
    fn apply(&mut self, input: T, out: &mut Vec<T>) -> OperatorFlow {
        if self.last.as_ref() != Some(&input) {
            self.last = Some(input.clone());
            out.push(input);
        }
        OperatorFlow::Continue
    }
}
