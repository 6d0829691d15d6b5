// SPDX-License-Identifier: Apache-2.0

//! A simulated Keep
//!
//! The [`Keep`] owns a protected region (an anonymous mapping standing in for
//! enclave memory), the host function table it calls out to, and, once
//! started, a switchless worker pool. It provides both crossing primitives:
//! [`Keep::ecall`] from the host into the Keep and [`Keep::ocall`] from the
//! Keep out to the host.

use crate::arena::{Arena, Arenas};
use crate::config::Config;
use crate::guest::Switchless;
use crate::host::manager::Manager;
use crate::host::{execute, Host};
use crate::item::{Call, Ecall, Status};
use crate::platform::{Platform, Region};
use crate::{Error, Result};

use std::fmt;
use std::hint::spin_loop;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mmarinus::{perms, Map};
use spin::Mutex;
use tracing::{debug, instrument, trace};

/// An execution context with a protected region and a host to call out to
pub struct Keep {
    // Only reserved, never accessed: it pins `region`.
    _protected: Map<perms::ReadWrite>,
    region: Region,
    bindings: usize,
    host: Arc<dyn Host>,
    switchless: Switchless,
    manager: Mutex<Option<Manager>>,
    arenas: Arc<Arenas>,
    crossings: AtomicU64,
    terminated: AtomicBool,
    poll: Duration,
    crossing_cost: Duration,
}

impl fmt::Debug for Keep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keep")
            .field("region", &self.region)
            .field("bindings", &self.bindings)
            .field("workers", &self.worker_count())
            .field("crossings", &self.crossings())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl Keep {
    /// Creates a Keep calling out to `host`.
    ///
    /// No worker is started; see [`Keep::start_switchless`].
    pub fn new(config: &Config, host: impl Host + 'static) -> Result<Arc<Self>> {
        Self::with_host(config, Arc::new(host))
    }

    /// Creates a Keep calling out to a shared `host`.
    pub fn with_host(config: &Config, host: Arc<dyn Host>) -> Result<Arc<Self>> {
        config.validate()?;

        let arenas = Arenas::with_max_capacity(config.arena.max_capacity);
        arenas.configure_capacity(config.arena.capacity)?;

        let protected = Map::bytes(config.keep.protected_size)
            .anywhere()
            .anonymously()
            .with(perms::ReadWrite)
            .map_err(|e| Error::Map(e.err))?;
        let region = Region::new(protected.addr(), protected.size());

        debug!(
            start = format_args!("{:#x}", region.line().start),
            size = region.size(),
            bindings = config.keep.bindings,
            "created keep"
        );

        Ok(Arc::new(Self {
            _protected: protected,
            region,
            bindings: config.keep.bindings,
            host,
            switchless: Switchless::new(),
            manager: Mutex::new(None),
            arenas: Arc::new(arenas),
            crossings: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
            poll: config.switchless.poll_interval(),
            crossing_cost: config.keep.crossing_cost(),
        }))
    }

    /// Starts the switchless worker pool and publishes it to the Keep.
    ///
    /// The pool never has more workers than the Keep has bindings. Returns
    /// the number of workers actually started. A Keep has at most one pool
    /// in its lifetime: once started, further calls fail with
    /// [`Error::AlreadyInitialized`], even after [`Keep::stop_switchless`].
    #[instrument(level = "debug", skip(self))]
    pub fn start_switchless(self: &Arc<Self>, workers: usize) -> Result<usize> {
        if workers == 0 {
            return Err(Error::InvalidParameter("worker count must not be zero"));
        }
        if self.is_terminated() {
            return Err(Error::InvalidParameter("keep is terminated"));
        }

        let mut slot = self.manager.lock();
        if slot.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let count = workers.min(self.bindings);
        let mut manager = Manager::start(self, count, self.poll)?;

        // Safety: the record and the arrays it names live in `manager`,
        // which is kept alive for the lifetime of the Keep.
        if let Err(e) = unsafe { self.ecall(Ecall::InitSwitchless, manager.record_argv()) } {
            manager.stop();
            return Err(e);
        }

        *slot = Some(manager);
        debug!(count, "switchless calls enabled");
        Ok(count)
    }

    /// Stops the switchless worker pool and waits for every worker to exit.
    ///
    /// Calls in flight are completed first; calls posted afterwards fall
    /// back to conventional crossings. Calling this again is a no-op.
    #[instrument(level = "debug", skip(self))]
    pub fn stop_switchless(&self) {
        if let Some(manager) = self.manager.lock().as_mut() {
            manager.stop();
        }
    }

    /// Stops the worker pool and rejects every further call.
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            debug!("terminating keep");
        }
        self.stop_switchless();
    }

    /// Whether [`Keep::terminate`] has been called
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Enters the Keep from the host.
    ///
    /// # Safety
    ///
    /// For [`Ecall::InitSwitchless`], `argv[0]` must either be null or point
    /// to `argv[1]` readable bytes, and a successfully published context
    /// array must outlive the Keep.
    pub unsafe fn ecall(&self, ecall: Ecall, argv: [usize; 2]) -> Result<()> {
        trace!(?ecall, "ecall");
        match ecall {
            Ecall::InitSwitchless => self.switchless.init(&self.region, argv[0], argv[1]),
        }
    }

    /// Leaves the Keep to execute `call` on the host.
    ///
    /// # Safety
    ///
    /// The buffers described by `call` must be valid.
    pub unsafe fn ocall(&self, call: &Call) -> Status {
        self.crossings.fetch_add(1, Ordering::Relaxed);

        if !self.crossing_cost.is_zero() {
            let start = Instant::now();
            while start.elapsed() < self.crossing_cost {
                spin_loop();
            }
        }

        execute(self.host.as_ref(), call)
    }

    /// Calls host function `num` with a conventional crossing.
    ///
    /// `input` and `output` are marshalled through `arena`, which is cleared
    /// afterwards. Returns the number of bytes copied into `output`.
    pub fn call_host_function(
        &self,
        arena: &mut Arena,
        num: usize,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize> {
        let result = self.call(arena, num, input, output, false);
        arena.clear();
        result
    }

    /// Calls host function `num` on a switchless worker.
    ///
    /// Falls back to a conventional crossing when every worker is busy.
    /// Fails with [`Error::NotInitialized`] if no worker pool has been
    /// started.
    pub fn call_host_function_switchless(
        &self,
        arena: &mut Arena,
        num: usize,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize> {
        let result = self.call(arena, num, input, output, true);
        arena.clear();
        result
    }

    fn call(
        &self,
        arena: &mut Arena,
        num: usize,
        input: &[u8],
        output: &mut [u8],
        switchless: bool,
    ) -> Result<usize> {
        if self.is_terminated() {
            return Err(Error::InvalidParameter("keep is terminated"));
        }

        let input_block = arena.copy_in(input)?;
        let output_block = arena.allocate(output.len())?;
        let call_block = arena.allocate(size_of::<Call>())?;

        for block in [input_block, output_block, call_block] {
            if !self
                .region
                .is_outside(block.as_ptr() as *mut u8 as usize, block.len())
            {
                return Err(Error::Untrusted("marshalled buffer is not outside the Keep"));
            }
        }

        // Safety: the block is large enough and aligned to `ALIGNMENT`,
        // which satisfies the alignment of `Call`.
        let call = unsafe {
            let ptr = call_block.as_ptr() as *mut Call;
            ptr.write(Call::new(num, input_block, output_block));
            &*ptr
        };

        // Safety: every block outlives the call, which is completed before
        // returning.
        let status = if switchless {
            match unsafe { self.switchless.post(call) } {
                Ok(()) => call.wait(),
                Err(Error::Busy) => {
                    trace!(num, "falling back to a conventional crossing");
                    unsafe { self.ocall(call) }
                }
                Err(e) => return Err(e),
            }
        } else {
            unsafe { self.ocall(call) }
        };

        if status != Status::Ok {
            return Err(Error::Host(status));
        }

        let written = call.written();
        if written > output.len() {
            return Err(Error::Untrusted("host wrote more than the output buffer"));
        }

        // Safety: the output block is `output.len()` bytes long.
        let result = unsafe { &output_block.as_ref()[..written] };
        output[..written].copy_from_slice(result);

        Ok(written)
    }

    /// The protected region
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// The arena registry of this Keep
    pub fn arenas(&self) -> &Arc<Arenas> {
        &self.arenas
    }

    /// Returns a new arena handle for the calling thread.
    pub fn arena(&self) -> Arena {
        self.arenas.arena()
    }

    /// Number of threads that may cross into the host concurrently
    pub fn bindings(&self) -> usize {
        self.bindings
    }

    /// Number of conventional crossings so far
    pub fn crossings(&self) -> u64 {
        self.crossings.load(Ordering::Relaxed)
    }

    /// Number of published switchless workers
    pub fn worker_count(&self) -> usize {
        self.switchless.worker_count()
    }

    /// Whether a switchless worker pool has been published
    pub fn is_switchless_initialized(&self) -> bool {
        self.switchless.is_initialized()
    }

    /// Whether the worker pool was started and has not been stopped
    pub fn is_switchless_running(&self) -> bool {
        matches!(self.manager.lock().as_ref(), Some(manager) if !manager.is_stopped())
    }

    /// The host this Keep calls out to
    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }
}

impl Drop for Keep {
    fn drop(&mut self) {
        self.terminate();
    }
}
