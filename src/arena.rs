// SPDX-License-Identifier: Apache-2.0

//! Scratch arenas for marshalling host call arguments
//!
//! Every thread that talks to the host gets its own bump allocator over a
//! fixed-size anonymous mapping. Allocation never takes a lock and never falls
//! back to the general purpose allocator: running out of arena space is a hard
//! failure, so the latency of the switchless path stays bounded.
//!
//! The backing mappings are owned by a shared [`Arenas`] registry. Creating an
//! arena is the only operation that takes the registry lock.

#[cfg(test)]
mod tests;

use crate::{Error, Result};

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mmarinus::{perms, Map};
use spin::Mutex;
use tracing::{debug, trace};

/// Alignment of every allocation: two machine words
pub const ALIGNMENT: usize = 2 * core::mem::size_of::<usize>();

/// Capacity of newly created arenas unless configured otherwise
pub const DEFAULT_CAPACITY: usize = 1 << 20;

/// Ceiling for the configurable arena capacity
pub const MAX_CAPACITY: usize = 1 << 30;

/// Rounds `size` up to [`ALIGNMENT`].
#[inline]
fn align_up(size: usize) -> Option<usize> {
    Some(size.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1))
}

/// A registered buffer no arena handle currently owns
#[derive(Debug)]
struct Free {
    base: usize,
    capacity: usize,
}

#[derive(Debug)]
struct Registry {
    maps: Vec<Map<perms::ReadWrite>>,
    free: Vec<Free>,
}

/// Registry of every arena buffer handed out by a runtime
#[derive(Debug)]
pub struct Arenas {
    capacity: AtomicUsize,
    max_capacity: usize,
    registry: Mutex<Registry>,
    generation: AtomicUsize,
}

impl Default for Arenas {
    fn default() -> Self {
        Self::new()
    }
}

impl Arenas {
    /// Creates an empty registry with the default capacity and ceiling.
    pub const fn new() -> Self {
        Self::with_max_capacity(MAX_CAPACITY)
    }

    /// Creates an empty registry with a custom capacity ceiling.
    ///
    /// The initial capacity is [`DEFAULT_CAPACITY`], or the ceiling if that
    /// is smaller.
    pub const fn with_max_capacity(max_capacity: usize) -> Self {
        let capacity = if DEFAULT_CAPACITY < max_capacity {
            DEFAULT_CAPACITY
        } else {
            max_capacity
        };

        Self {
            capacity: AtomicUsize::new(capacity),
            max_capacity,
            registry: Mutex::new(Registry {
                maps: Vec::new(),
                free: Vec::new(),
            }),
            generation: AtomicUsize::new(0),
        }
    }

    /// Sets the capacity of arenas created from now on.
    ///
    /// Arenas that already exist keep their capacity. Fails without changing
    /// anything if `capacity` exceeds [`Arenas::max_capacity`].
    pub fn configure_capacity(&self, capacity: usize) -> Result<()> {
        if capacity > self.max_capacity {
            return Err(Error::CapacityTooLarge {
                requested: capacity,
                max: self.max_capacity,
            });
        }

        self.capacity.store(capacity, Ordering::Relaxed);
        debug!(capacity, "configured arena capacity");
        Ok(())
    }

    /// The capacity new arenas are created with
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// The ceiling for [`Arenas::configure_capacity`]
    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Number of arena buffers currently registered
    pub fn count(&self) -> usize {
        self.registry.lock().maps.len()
    }

    /// Returns a new, still empty, arena handle for the calling thread.
    ///
    /// The backing buffer is only reserved on the first allocation.
    pub fn arena(self: &Arc<Self>) -> Arena {
        Arena {
            arenas: self.clone(),
            buffer: None,
        }
    }

    /// Hands out a buffer of the configured capacity.
    ///
    /// A buffer given back by a dropped [`Arena`] is reused if it has that
    /// capacity; otherwise a new one is reserved and registered.
    fn register(&self) -> Result<Buffer> {
        let capacity = self.capacity();

        {
            let mut registry = self.registry.lock();
            let generation = self.generation.load(Ordering::Acquire);

            if let Some(index) = registry.free.iter().position(|f| f.capacity == capacity) {
                let free = registry.free.swap_remove(index);
                trace!(capacity, "reused arena");

                return Ok(Buffer {
                    base: NonNull::new(free.base as *mut u8).ok_or(Error::OutOfMemory)?,
                    capacity,
                    used: 0,
                    generation,
                });
            }
        }

        let map = Map::bytes(capacity.max(1))
            .anywhere()
            .anonymously()
            .with(perms::ReadWrite)
            .map_err(|e| Error::Map(e.err))?;

        let base = NonNull::new(map.addr() as *mut u8).ok_or(Error::OutOfMemory)?;

        let mut registry = self.registry.lock();
        // Read under the lock so a concurrent teardown is either fully before
        // or fully after this registration.
        let generation = self.generation.load(Ordering::Acquire);
        registry.maps.push(map);
        debug!(capacity, count = registry.maps.len(), "registered arena");

        Ok(Buffer {
            base,
            capacity,
            used: 0,
            generation,
        })
    }

    /// Takes back the buffer of a dropped arena, unless it was torn down.
    fn release(&self, buffer: Buffer) {
        let mut registry = self.registry.lock();
        if buffer.generation != self.generation.load(Ordering::Acquire) {
            return;
        }

        registry.free.push(Free {
            base: buffer.base.as_ptr() as usize,
            capacity: buffer.capacity,
        });
    }

    /// Releases every registered buffer and empties the registry.
    ///
    /// Live [`Arena`] handles notice the teardown and reserve a fresh buffer
    /// on their next allocation.
    ///
    /// # Safety
    ///
    /// No thread may be allocating from, or using memory handed out by, any
    /// arena of this registry.
    pub unsafe fn teardown(&self) {
        let mut registry = self.registry.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let count = registry.maps.len();
        registry.maps.clear();
        registry.free.clear();
        trace!(count, "released arenas");
    }
}

#[derive(Debug)]
struct Buffer {
    base: NonNull<u8>,
    capacity: usize,
    used: usize,
    generation: usize,
}

/// A thread-exclusive bump allocator
///
/// The handle is neither `Send` nor `Sync`: one thread owns it and is the
/// only one allocating from it. Dropping it hands its buffer back to the
/// registry for the next arena of the same capacity.
#[derive(Debug)]
pub struct Arena {
    arenas: Arc<Arenas>,
    buffer: Option<Buffer>,
}

impl Arena {
    fn buffer(&mut self) -> Result<&mut Buffer> {
        let generation = self.arenas.generation.load(Ordering::Acquire);

        match &mut self.buffer {
            Some(buffer) if buffer.generation == generation => {}
            stale => *stale = Some(self.arenas.register()?),
        }

        self.buffer.as_mut().ok_or(Error::OutOfMemory)
    }

    /// Allocates `size` bytes, rounded up to [`ALIGNMENT`].
    ///
    /// The returned memory is uninitialized and valid until the next
    /// [`Arena::clear`]. A failed allocation leaves the arena untouched.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>> {
        let rounded = align_up(size).ok_or(Error::Overflow)?;
        let buffer = self.buffer()?;

        let used = buffer.used.checked_add(rounded).ok_or(Error::Overflow)?;
        if used > buffer.capacity {
            trace!(size, used = buffer.used, "arena exhausted");
            return Err(Error::OutOfMemory);
        }

        // Safety: `buffer.used + rounded <= buffer.capacity`
        let start = unsafe { buffer.base.as_ptr().add(buffer.used) };
        buffer.used = used;

        Ok(NonNull::slice_from_raw_parts(
            // Safety: derived from a non-null mapping base
            unsafe { NonNull::new_unchecked(start) },
            size,
        ))
    }

    /// Allocates `count * size` bytes and zero-fills them.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Result<NonNull<[u8]>> {
        let total = count.checked_mul(size).ok_or(Error::Overflow)?;
        let block = self.allocate(total)?;

        // Safety: the block was just allocated with `total` bytes
        unsafe { ptr::write_bytes(block.as_ptr() as *mut u8, 0, total) };
        Ok(block)
    }

    /// Allocates a copy of `bytes`.
    pub fn copy_in(&mut self, bytes: &[u8]) -> Result<NonNull<[u8]>> {
        let block = self.allocate(bytes.len())?;

        // Safety: the block was just allocated with `bytes.len()` bytes and
        // cannot overlap a live borrow
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), block.as_ptr() as *mut u8, bytes.len())
        };
        Ok(block)
    }

    /// Makes the whole capacity available again.
    ///
    /// Every pointer previously handed out by this arena becomes invalid.
    #[inline]
    pub fn clear(&mut self) {
        if let Some(buffer) = &mut self.buffer {
            buffer.used = 0;
        }
    }

    /// Bytes handed out since the last [`Arena::clear`]
    #[inline]
    pub fn used(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.used)
    }

    /// Capacity of the backing buffer, or zero before the first allocation
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.capacity)
    }

    /// The registry this arena belongs to
    pub fn arenas(&self) -> &Arc<Arenas> {
        &self.arenas
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.arenas.release(buffer);
        }
    }
}
