/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

#![deny(warnings, missing_docs, clippy::all, rustdoc::broken_intra_doc_links)]

//! Time unit conversions, duration formatting and UTC calendar arithmetic.
//!
//! The conversions here all bottom out in [`std::time::Duration`], while the
//! calendar operations work on [`chrono::DateTime<Utc>`] so that units above
//! seconds honour calendar semantics (weeks start on Monday, month lengths
//! vary).

mod calendar;
mod units;

pub use crate::calendar::add;
pub use crate::calendar::floor;
pub use crate::calendar::TimeUnit;
pub use crate::units::days;
pub use crate::units::format_duration;
pub use crate::units::hours;
pub use crate::units::hz;
pub use crate::units::micros;
pub use crate::units::millis;
pub use crate::units::minutes;
pub use crate::units::nanos;
pub use crate::units::seconds;
pub use crate::units::to_millis;
pub use crate::units::OverflowError;
