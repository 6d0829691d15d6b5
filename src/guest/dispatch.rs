// SPDX-License-Identifier: Apache-2.0

use super::Switchless;
use crate::item::Call;
use crate::{Error, Result};

use tracing::trace;

impl Switchless {
    /// Posts `call` to the first free worker.
    ///
    /// Every worker slot is tried at most once. Returns [`Error::Busy`] if
    /// none could be claimed, in which case the call was not posted and the
    /// caller should cross into the host the conventional way. Never blocks.
    ///
    /// On success, completion is signalled by [`Call::result`] returning
    /// `Some`.
    ///
    /// # Safety
    ///
    /// On success, `call` and the buffers it describes must stay valid and
    /// untouched until the call has been completed.
    pub unsafe fn post(&self, call: &Call) -> Result<()> {
        call.seed();

        let contexts = self.contexts().ok_or(Error::NotInitialized)?;
        let ptr = call as *const Call as *mut Call;

        for (index, context) in contexts.iter().enumerate() {
            if context.claim(ptr) {
                trace!(index, num = call.num, "posted switchless call");
                return Ok(());
            }
        }

        trace!(num = call.num, "all switchless workers are busy");
        Err(Error::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::item::{Record, Slot, Status, WorkerContext};
    use crate::platform::Region;

    use core::mem::size_of;
    use core::ptr::NonNull;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;
    use std::thread;

    struct Fixture {
        contexts: Vec<WorkerContext>,
        threads: Vec<u64>,
        switchless: Switchless,
    }

    impl Fixture {
        fn new(count: usize) -> Self {
            let fixture = Self {
                contexts: (0..count).map(|_| WorkerContext::new(Weak::new())).collect(),
                threads: vec![0; count],
                switchless: Switchless::new(),
            };

            let record = Record {
                contexts: fixture.contexts.as_ptr(),
                threads: fixture.threads.as_ptr(),
                count: count as u32,
            };

            unsafe {
                fixture
                    .switchless
                    .init(
                        &Region::new(0, 0),
                        &record as *const Record as usize,
                        size_of::<Record>(),
                    )
                    .unwrap()
            };

            fixture
        }
    }

    fn call() -> Call {
        let empty = NonNull::slice_from_raw_parts(NonNull::dangling(), 0);
        Call::new(0, empty, empty)
    }

    #[test]
    fn not_initialized() {
        let switchless = Switchless::new();
        let call = call();
        call.complete(0, Status::Ok);

        assert!(matches!(
            unsafe { switchless.post(&call) },
            Err(Error::NotInitialized)
        ));
        assert_eq!(call.result(), None);
    }

    #[test]
    fn distinct_slots_then_busy() {
        const COUNT: usize = 3;

        let fixture = Fixture::new(COUNT);
        let calls: Vec<Call> = (0..=COUNT).map(|_| call()).collect();

        for call in &calls[..COUNT] {
            unsafe { fixture.switchless.post(call).unwrap() };
            assert_eq!(call.result(), None);
        }

        for (context, call) in fixture.contexts.iter().zip(&calls) {
            assert_eq!(context.slot(), Slot::Claimed(NonNull::from(call)));
        }

        let err = unsafe { fixture.switchless.post(&calls[COUNT]) }.unwrap_err();
        assert!(err.is_busy());
    }

    #[test]
    fn freed_slot_is_reused() {
        let fixture = Fixture::new(2);
        let calls = [call(), call(), call()];

        unsafe {
            fixture.switchless.post(&calls[0]).unwrap();
            fixture.switchless.post(&calls[1]).unwrap();
        }

        calls[0].complete(0, Status::Ok);
        fixture.contexts[0].release(Status::Ok);

        unsafe { fixture.switchless.post(&calls[2]).unwrap() };
        assert_eq!(
            fixture.contexts[0].slot(),
            Slot::Claimed(NonNull::from(&calls[2]))
        );
    }

    #[test]
    fn retired_slots_are_busy() {
        let fixture = Fixture::new(2);
        for context in &fixture.contexts {
            assert!(context.retire());
        }

        let call = call();
        assert!(matches!(
            unsafe { fixture.switchless.post(&call) },
            Err(Error::Busy)
        ));
    }

    #[test]
    fn race_for_single_slot() {
        const ROUNDS: usize = 64;

        for _ in 0..ROUNDS {
            let fixture = Fixture::new(1);
            let posted = AtomicUsize::new(0);
            let busy = AtomicUsize::new(0);

            thread::scope(|scope| {
                for _ in 0..2 {
                    scope.spawn(|| {
                        let call = Box::leak(Box::new(call()));
                        match unsafe { fixture.switchless.post(call) } {
                            Ok(()) => posted.fetch_add(1, Ordering::Relaxed),
                            Err(Error::Busy) => busy.fetch_add(1, Ordering::Relaxed),
                            Err(e) => panic!("unexpected error: {e}"),
                        };
                    });
                }
            });

            assert_eq!(posted.load(Ordering::Relaxed), 1);
            assert_eq!(busy.load(Ordering::Relaxed), 1);
        }
    }
}
