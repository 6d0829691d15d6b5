// SPDX-License-Identifier: Apache-2.0

//! Host-side handling of calls coming out of the Keep
//!
//! [`Host`] is the conventional invocation primitive: whatever the transport,
//! a host call ends up as a function number plus an input and an output
//! buffer. The switchless [`manager`] merely runs it on dedicated worker
//! threads instead of on the crossing thread.

pub mod manager;
pub mod worker;

use crate::item::{Call, Status};

use std::fmt;

use tracing::trace;

/// Something that can execute host calls
pub trait Host: Send + Sync {
    /// Executes host function `num`.
    ///
    /// Returns the number of bytes written to `output`.
    fn call(&self, num: usize, input: &[u8], output: &mut [u8]) -> Result<usize, Status>;
}

type Function = Box<dyn Fn(&[u8], &mut [u8]) -> Result<usize, Status> + Send + Sync>;

/// A table of host functions, indexed by registration order
#[derive(Default)]
pub struct Table {
    functions: Vec<Function>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("functions", &self.functions.len())
            .finish()
    }
}

impl Table {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a host function and returns its number.
    pub fn register<F>(&mut self, function: F) -> usize
    where
        F: Fn(&[u8], &mut [u8]) -> Result<usize, Status> + Send + Sync + 'static,
    {
        self.functions.push(Box::new(function));
        self.functions.len() - 1
    }

    /// Builder variant of [`Table::register`].
    pub fn with<F>(mut self, function: F) -> Self
    where
        F: Fn(&[u8], &mut [u8]) -> Result<usize, Status> + Send + Sync + 'static,
    {
        self.register(function);
        self
    }

    /// Number of registered functions
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether no function is registered
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl Host for Table {
    fn call(&self, num: usize, input: &[u8], output: &mut [u8]) -> Result<usize, Status> {
        let function = self.functions.get(num).ok_or(Status::NotFound)?;
        function(input, output)
    }
}

/// Executes `call` on `host` and completes it.
///
/// # Safety
///
/// The buffers described by `call` must be valid and must not be accessed by
/// anybody else until the call is completed.
pub(crate) unsafe fn execute(host: &dyn Host, call: &Call) -> Status {
    let output = call.output();
    let len = output.len();

    let (written, status) = match host.call(call.num, call.input(), output) {
        Ok(written) if written > len => (0, Status::BufferTooSmall),
        Ok(written) => (written, Status::Ok),
        Err(Status::Ok) => (0, Status::Unexpected),
        Err(status) => (0, status),
    };

    trace!(num = call.num, written, ?status, "executed host call");
    call.complete(written, status);
    status
}
