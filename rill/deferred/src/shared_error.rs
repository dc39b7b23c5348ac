/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::fmt;
use std::sync::Arc;

use anyhow::Error;

/// A cloneable wrapper around [anyhow::Error].
///
/// A deferred value is observed by any number of continuations, so its error
/// state must be cloneable. `SharedError` achieves that by keeping the
/// underlying error in an [Arc].
#[derive(Clone)]
pub struct SharedError {
    error: Arc<Error>,
}

impl SharedError {
    /// Wraps any error that can become an [anyhow::Error].
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Error>,
    {
        SharedError {
            error: Arc::new(error.into()),
        }
    }

    /// Access the wrapped error.
    pub fn inner(&self) -> &Error {
        &self.error
    }

    /// Attempt to downcast the wrapped error to a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.error.as_ref(), f)
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.error.as_ref(), f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

impl From<Error> for SharedError {
    fn from(error: Error) -> Self {
        SharedError {
            error: Arc::new(error),
        }
    }
}
