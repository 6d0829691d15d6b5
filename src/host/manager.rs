// SPDX-License-Identifier: Apache-2.0

//! The switchless manager
//!
//! The manager owns the worker pool of a Keep: the context array shared with
//! the Keep, the thread identifier array, the record describing both, and
//! the worker threads themselves.

use super::worker::Worker;
use crate::item::{Record, WorkerContext};
use crate::keep::Keep;
use crate::{Error, Result};

use std::io;
use std::mem::size_of;
use std::os::unix::thread::JoinHandleExt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, instrument};

/// A running pool of switchless workers
#[derive(Debug)]
pub struct Manager {
    record: Box<Record>,
    contexts: Arc<[WorkerContext]>,
    threads: Box<[u64]>,
    handles: Vec<JoinHandle<()>>,
}

// Safety: the raw pointers in `record` point into `contexts` and `threads`,
// which move along with the manager.
unsafe impl Send for Manager {}

impl Manager {
    /// Spawns `count` workers serving `owner`.
    ///
    /// If spawning any worker fails, the workers spawned so far are stopped
    /// and joined before the error is returned.
    pub fn start(owner: &Arc<Keep>, count: usize, poll: Duration) -> Result<Self> {
        Self::start_with(Arc::downgrade(owner), count, poll, |index, worker| {
            thread::Builder::new()
                .name(format!("switchless-{index}"))
                .spawn(move || worker.run())
        })
    }

    #[instrument(level = "debug", skip(owner, spawn))]
    fn start_with<F>(owner: Weak<Keep>, count: usize, poll: Duration, mut spawn: F) -> Result<Self>
    where
        F: FnMut(usize, Worker) -> io::Result<JoinHandle<()>>,
    {
        if count == 0 {
            return Err(Error::InvalidParameter("worker count must not be zero"));
        }
        if u32::try_from(count).is_err() {
            return Err(Error::InvalidParameter("too many workers"));
        }

        let contexts: Arc<[WorkerContext]> = (0..count)
            .map(|_| WorkerContext::new(owner.clone()))
            .collect();

        let mut manager = Self {
            record: Box::new(Record {
                contexts: contexts.as_ptr(),
                threads: core::ptr::null(),
                count: count as u32,
            }),
            contexts,
            threads: vec![0; count].into_boxed_slice(),
            handles: Vec::with_capacity(count),
        };
        manager.record.threads = manager.threads.as_ptr();

        for index in 0..count {
            let worker = Worker::new(manager.contexts.clone(), index, poll);

            match spawn(index, worker) {
                Ok(handle) => {
                    manager.threads[index] = handle.as_pthread_t() as _;
                    manager.handles.push(handle);
                }
                Err(e) => {
                    error!(index, "failed to spawn switchless worker: {e}");
                    manager.stop();
                    return Err(Error::Spawn(e));
                }
            }
        }

        debug!(count, "started switchless workers");
        Ok(manager)
    }

    /// Stops every worker and waits for them to exit.
    ///
    /// All workers are signalled before the first one is joined. Calls that
    /// are in flight are completed first. Calling this again is a no-op.
    pub fn stop(&mut self) {
        for context in self.contexts.iter() {
            context.stop();
        }

        let current = thread::current().id();
        let joined = self.handles.len();

        for handle in self.handles.drain(..) {
            // A worker dropping the last reference to its Keep ends up here.
            if handle.thread().id() == current {
                continue;
            }

            if let Err(e) = handle.join() {
                error!("switchless worker panicked: {e:#?}");
            }
        }

        if joined > 0 {
            debug!(joined, "stopped switchless workers");
        }
    }

    /// Whether [`Manager::stop`] has been called
    pub fn is_stopped(&self) -> bool {
        self.handles.is_empty() && self.contexts.iter().all(|c| c.is_stopping())
    }

    /// Number of workers
    pub fn count(&self) -> usize {
        self.contexts.len()
    }

    /// The worker contexts shared with the Keep
    pub fn contexts(&self) -> &[WorkerContext] {
        &self.contexts
    }

    /// Native thread identifiers of the workers, zero for unspawned ones
    pub fn threads(&self) -> &[u64] {
        &self.threads
    }

    /// The record to publish to the Keep
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Address and size of the record, as passed to
    /// [`Ecall::InitSwitchless`](crate::item::Ecall::InitSwitchless)
    pub fn record_argv(&self) -> [usize; 2] {
        [&*self.record as *const Record as usize, size_of::<Record>()]
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.stop();
    }
}
