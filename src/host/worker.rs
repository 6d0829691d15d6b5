// SPDX-License-Identifier: Apache-2.0

//! The switchless worker loop

use super::execute;
use crate::item::{Call, Slot, Status, WorkerContext};

use std::hint::spin_loop;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{trace, trace_span, warn};

/// A host thread serving a single [`WorkerContext`]
#[derive(Debug)]
pub struct Worker {
    contexts: Arc<[WorkerContext]>,
    index: usize,
    poll: Duration,
}

impl Worker {
    /// Creates a worker for `contexts[index]`.
    ///
    /// A zero `poll` interval busy-waits between empty polls, anything else
    /// sleeps that long.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn new(contexts: Arc<[WorkerContext]>, index: usize, poll: Duration) -> Self {
        assert!(index < contexts.len());
        Self {
            contexts,
            index,
            poll,
        }
    }

    #[cfg(test)]
    pub(crate) fn contexts(&self) -> &Arc<[WorkerContext]> {
        &self.contexts
    }

    #[inline]
    fn context(&self) -> &WorkerContext {
        &self.contexts[self.index]
    }

    /// Serves calls until the context is asked to stop.
    ///
    /// A call claimed before the stop request is always completed. On exit
    /// the slot is retired so that it can never be claimed again.
    pub fn run(self) {
        let span = trace_span!("switchless worker", index = self.index);
        let _enter = span.enter();
        trace!("started");

        let context = self.context();
        let mut served = 0usize;

        loop {
            match context.slot() {
                Slot::Claimed(call) => {
                    self.serve(call);
                    served += 1;
                    continue;
                }
                Slot::Retired => break,
                Slot::Free => {}
            }

            // A failed retire means a call was claimed in the meantime.
            if context.is_stopping() && context.retire() {
                break;
            }

            if self.poll.is_zero() {
                spin_loop();
            } else {
                thread::sleep(self.poll);
            }
        }

        trace!(served, "stopped");
    }

    fn serve(&self, call: NonNull<Call>) {
        let context = self.context();

        // Safety: the claimant keeps the call alive until it is completed.
        let call = unsafe { call.as_ref() };

        // Do not hold on to the Keep while executing: dropping the last
        // reference from here would join this very thread.
        let host = context.owner().upgrade().map(|keep| keep.host().clone());

        let status = match host {
            // Safety: see above
            Some(host) => unsafe { execute(host.as_ref(), call) },
            None => {
                warn!(num = call.num, "owner is gone, failing call");
                call.complete(0, Status::Unexpected);
                Status::Unexpected
            }
        };

        context.release(status);
    }
}
