// SPDX-License-Identifier: Apache-2.0

use super::{Published, Switchless};
use crate::item::{Record, WorkerContext};
use crate::platform::{is_aligned_non_null, Platform};
use crate::{Error, Result};

use core::mem::size_of;
use core::ptr::{self, NonNull};

use tracing::{debug, instrument, warn};

#[inline]
fn reject(reason: &'static str) -> Error {
    warn!(reason, "rejected switchless manager record");
    Error::Untrusted(reason)
}

/// Validates an array of `T` at `addr` of `size` bytes, if computable.
fn validate_array<T>(
    platform: &impl Platform,
    addr: usize,
    size: Option<usize>,
    what: &'static str,
) -> Result<usize> {
    let addr = is_aligned_non_null::<T>(addr).ok_or_else(|| reject(what))?;
    let size = size.ok_or_else(|| reject(what))?;
    if !platform.is_outside(addr, size) {
        return Err(reject(what));
    }
    Ok(addr)
}

impl Switchless {
    /// Validates and publishes the host's switchless manager record.
    ///
    /// The record is copied into Keep memory before anything in it is
    /// looked at; the host may change its own copy at any time without
    /// affecting what gets published. On error nothing is published.
    ///
    /// # Safety
    ///
    /// If `addr` is non-null, `[addr, addr + size)` must be readable. If
    /// validation succeeds, the context array it names must stay valid for
    /// as long as `self` is used.
    #[instrument(level = "debug", skip(self, platform))]
    pub unsafe fn init(&self, platform: &impl Platform, addr: usize, size: usize) -> Result<()> {
        if addr == 0 {
            return Err(Error::InvalidParameter("manager record is null"));
        }

        if size != size_of::<Record>() {
            return Err(reject("manager record has the wrong size"));
        }

        let addr = is_aligned_non_null::<Record>(addr)
            .ok_or_else(|| reject("manager record is misaligned"))?;

        if !platform.is_outside(addr, size) {
            return Err(reject("manager record is not outside the Keep"));
        }

        // From here on, only the snapshot is used.
        let record = ptr::read_volatile(addr as *const Record);

        let count = record.count as usize;
        if count == 0 {
            return Err(reject("manager record has no workers"));
        }

        let contexts = validate_array::<WorkerContext>(
            platform,
            record.contexts as usize,
            Record::contexts_size(count),
            "worker context array is invalid or not outside the Keep",
        )?;

        validate_array::<u64>(
            platform,
            record.threads as usize,
            Record::threads_size(count),
            "worker thread array is invalid or not outside the Keep",
        )?;

        let mut ours = false;
        self.published.call_once(|| {
            ours = true;
            Published {
                count,
                contexts: NonNull::new_unchecked(contexts as *mut WorkerContext),
            }
        });

        if !ours {
            warn!("switchless manager record published twice");
            return Err(Error::AlreadyInitialized);
        }

        debug!(count, "published switchless workers");
        Ok(())
    }
}
