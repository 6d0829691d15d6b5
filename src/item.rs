// SPDX-License-Identifier: Apache-2.0

//! Records shared between the Keep and the host.
//!
//! Everything in here lives in memory both sides can reach. The layouts are
//! `#[repr(C)]` so that both sides agree on field order and sizes; the Keep
//! never trusts any of the values it reads back.

use crate::keep::Keep;

use std::hint::spin_loop;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Weak;

/// Result code of a host call
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// The call succeeded
    Ok = 0,
    /// The host function reported a failure
    Failure = 1,
    /// The host function rejected its arguments
    InvalidParameter = 2,
    /// The output buffer was too small for the result
    BufferTooSmall = 3,
    /// No host function is registered under the requested number
    NotFound = 4,
    /// The call could not be executed at all
    Unexpected = 5,
}

impl Status {
    /// Sentinel stored in [`Call`] while the call has not been processed yet.
    pub const PENDING: u32 = u32::MAX;
}

impl From<u32> for Status {
    /// Values written by the host are untrusted: anything unknown maps to
    /// [`Status::Unexpected`].
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Failure,
            2 => Self::InvalidParameter,
            3 => Self::BufferTooSmall,
            4 => Self::NotFound,
            _ => Self::Unexpected,
        }
    }
}

impl From<Status> for u32 {
    fn from(status: Status) -> Self {
        status as u32
    }
}

/// Calls from the host into the Keep
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ecall {
    /// Publish a switchless manager: `argv = [record address, record size]`
    InitSwitchless = 0x01,
}

/// A host call descriptor
///
/// The descriptor only carries addresses; the caller keeps the buffers
/// alive until [`Call::result`] is no longer `None`.
#[repr(C)]
#[derive(Debug)]
pub struct Call {
    /// The host function number
    pub num: usize,
    input: *const u8,
    input_len: usize,
    output: *mut u8,
    output_len: usize,
    written: AtomicUsize,
    result: AtomicU32,
}

impl Call {
    /// Creates a pending call reading `input` and writing into `output`.
    pub fn new(num: usize, input: NonNull<[u8]>, output: NonNull<[u8]>) -> Self {
        Self {
            num,
            input: input.as_ptr() as *const u8,
            input_len: input.len(),
            output: output.as_ptr() as *mut u8,
            output_len: output.len(),
            written: AtomicUsize::new(0),
            result: AtomicU32::new(Status::PENDING),
        }
    }

    /// Marks the call as not yet processed.
    #[inline]
    pub(crate) fn seed(&self) {
        self.written.store(0, Ordering::Relaxed);
        self.result.store(Status::PENDING, Ordering::Relaxed);
    }

    /// Publishes the outcome of the call.
    #[inline]
    pub(crate) fn complete(&self, written: usize, status: Status) {
        self.written.store(written, Ordering::Relaxed);
        self.result.store(status.into(), Ordering::Release);
    }

    /// Returns the outcome, or `None` while the call is pending.
    #[inline]
    pub fn result(&self) -> Option<Status> {
        match self.result.load(Ordering::Acquire) {
            Status::PENDING => None,
            status => Some(status.into()),
        }
    }

    /// Busy-waits until the call has been processed.
    pub fn wait(&self) -> Status {
        loop {
            if let Some(status) = self.result() {
                return status;
            }
            spin_loop();
        }
    }

    /// Number of output bytes the host claims to have written.
    #[inline]
    pub fn written(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }

    /// Returns the input buffer.
    ///
    /// # Safety
    ///
    /// The input buffer passed to [`Call::new`] must still be valid.
    pub(crate) unsafe fn input(&self) -> &[u8] {
        match self.input_len {
            0 => &[],
            len => slice::from_raw_parts(self.input, len),
        }
    }

    /// Returns the output buffer.
    ///
    /// # Safety
    ///
    /// The output buffer passed to [`Call::new`] must still be valid and not
    /// be accessed by anybody else until the call is completed.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn output(&self) -> &mut [u8] {
        match self.output_len {
            0 => &mut [],
            len => slice::from_raw_parts_mut(self.output, len),
        }
    }
}

/// Slot value of a worker that has exited and will never serve a call again.
const RETIRED: *mut Call = usize::MAX as *mut Call;

/// State of a worker slot, as seen by a single reader
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    /// No call is posted
    Free,
    /// A call has been claimed and not yet completed
    Claimed(NonNull<Call>),
    /// The worker has exited
    Retired,
}

/// A single-slot mailbox between the Keep and one host worker thread
#[repr(C)]
#[derive(Debug)]
pub struct WorkerContext {
    call: AtomicPtr<Call>,
    stopping: AtomicBool,
    owner: Weak<Keep>,
    last_result: AtomicU32,
}

impl WorkerContext {
    /// Creates a free context serving `owner`.
    pub fn new(owner: Weak<Keep>) -> Self {
        Self {
            call: AtomicPtr::new(ptr::null_mut()),
            stopping: AtomicBool::new(false),
            owner,
            last_result: AtomicU32::new(Status::PENDING),
        }
    }

    /// Returns the current slot state.
    #[inline]
    pub fn slot(&self) -> Slot {
        match self.call.load(Ordering::Acquire) {
            p if p.is_null() => Slot::Free,
            p if p == RETIRED => Slot::Retired,
            p => Slot::Claimed(unsafe { NonNull::new_unchecked(p) }),
        }
    }

    /// Attempts to transition the slot from free to holding `call`.
    ///
    /// At most one concurrent claimant wins.
    #[inline]
    pub(crate) fn claim(&self, call: *mut Call) -> bool {
        self.call.load(Ordering::Relaxed).is_null()
            && self
                .call
                .compare_exchange(ptr::null_mut(), call, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    /// Frees the slot after the claimed call has been completed.
    ///
    /// Only the worker serving the claim may call this.
    #[inline]
    pub(crate) fn release(&self, status: Status) {
        self.last_result.store(status.into(), Ordering::Relaxed);
        self.call.store(ptr::null_mut(), Ordering::Release);
    }

    /// Attempts to transition the slot from free to retired.
    #[inline]
    pub(crate) fn retire(&self) -> bool {
        self.call
            .compare_exchange(ptr::null_mut(), RETIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Asks the worker to exit after its current call.
    #[inline]
    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    /// Whether the worker has been asked to exit.
    #[inline]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// The Keep this worker serves.
    #[inline]
    pub fn owner(&self) -> &Weak<Keep> {
        &self.owner
    }

    /// Outcome of the most recently completed call.
    #[inline]
    pub fn last_result(&self) -> Option<Status> {
        match self.last_result.load(Ordering::Relaxed) {
            Status::PENDING => None,
            status => Some(status.into()),
        }
    }
}

/// The switchless manager record published to the Keep
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Record {
    /// Address of the first of `count` [`WorkerContext`]s
    pub contexts: *const WorkerContext,
    /// Address of the first of `count` thread identifiers
    pub threads: *const u64,
    /// Number of workers
    pub count: u32,
}

impl Record {
    /// Size in bytes of the context array described by `count`.
    #[inline]
    pub(crate) fn contexts_size(count: usize) -> Option<usize> {
        size_of::<WorkerContext>().checked_mul(count)
    }

    /// Size in bytes of the thread identifier array described by `count`.
    #[inline]
    pub(crate) fn threads_size(count: usize) -> Option<usize> {
        size_of::<u64>().checked_mul(count)
    }
}
