// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The dispatcher contract every component schedules timers against.
//!
//! All components in this crate run on one logical thread owned by the
//! embedder. The embedder supplies an implementation of [`Dispatcher`]
//! whose scheduled tasks run on that same thread. Deferred tasks capture
//! `Weak` references to their owning manager and upgrade-or-drop when
//! they fire, so a destroyed manager silently invalidates its latent
//! callbacks.

use std::time::{Duration, Instant};

/// A deferred closure run on the dispatcher thread.
pub type Task = Box<dyn FnOnce() + 'static>;

/// Identifies a scheduled task for cancellation. Handles of fired or
/// already-canceled tasks cancel to a no-op.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TaskHandle(pub(crate) u64);

/// Scheduling surface provided by the embedder.
pub trait Dispatcher {
    /// The current time on the dispatcher's clock.
    fn now(&self) -> Instant;

    /// Runs `task` on the dispatcher thread once `delay` has elapsed.
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle;

    /// Cancels a scheduled task. Idempotent.
    fn cancel(&self, handle: TaskHandle);
}
