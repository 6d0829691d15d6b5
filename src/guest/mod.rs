// SPDX-License-Identifier: Apache-2.0

//! Keep-side view of the switchless machinery
//!
//! The host tells the Keep about its worker pool exactly once, through
//! [`Switchless::init`]. From then on the Keep posts calls into the published
//! worker contexts with [`Switchless::post`] without ever reading the
//! host-provided record again.

mod dispatch;
mod init;

use crate::item::WorkerContext;

use core::ptr::NonNull;
use core::slice;

use spin::Once;

/// The validated worker pool, as seen from inside the Keep
#[derive(Debug)]
struct Published {
    count: usize,
    contexts: NonNull<WorkerContext>,
}

// Safety: the published contexts are only accessed through atomics.
unsafe impl Send for Published {}
unsafe impl Sync for Published {}

/// Switchless state of a single Keep
#[derive(Debug, Default)]
pub struct Switchless {
    published: Once<Published>,
}

impl Switchless {
    /// Creates an uninitialized instance.
    pub const fn new() -> Self {
        Self {
            published: Once::new(),
        }
    }

    /// Whether a worker pool has been published
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.worker_count() != 0
    }

    /// Number of published workers, zero before initialization
    #[inline]
    pub fn worker_count(&self) -> usize {
        self.published.get().map_or(0, |p| p.count)
    }

    #[inline]
    fn contexts(&self) -> Option<&[WorkerContext]> {
        self.published
            .get()
            // Safety: validated and published by `init`, and kept alive by
            // the host until the Keep is terminated.
            .map(|p| unsafe { slice::from_raw_parts(p.contexts.as_ptr(), p.count) })
    }
}
