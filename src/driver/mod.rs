//! Per-worker io_uring reactor.
//!
//! Each worker owns one ring. Submissions batch in the submission queue and
//! are flushed by the worker's maintenance tick, when the batch grows past a
//! threshold, or before parking. Completions are matched back to their
//! operation records through a slab keyed by `user_data`.

pub(crate) mod op;
mod unpark;

pub(crate) use op::{OpComplete, TOKEN_IGNORE, TOKEN_UNPARK};
pub use op::{Op, Payload};
pub(crate) use unpark::Unpark;

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use io_uring::types::{SubmitArgs, Timespec};
use io_uring::{opcode, squeue, types, IoUring};
use slab::Slab;
use thiserror::Error;

use crate::runtime::RuntimeConfig;
use crate::time::Timer;
use op::OpCell;

#[derive(Debug, Error)]
pub enum DriverError {
    /// Both the submission queue and the in-flight operation table are full
    /// and could not be drained without blocking.
    #[error("no submission slot available")]
    NoSubmissionSlot,
}

pub(crate) struct Driver {
    ring: IoUring,
    /// In-flight operations, keyed by the `user_data` of their entries.
    ops: Slab<Arc<dyn OpComplete>>,
    /// Cap on concurrently tracked operations, sized to the completion ring.
    max_in_flight: usize,
    unpark: Unpark,
    unpark_armed: bool,
    /// Read destination for the unpark eventfd; boxed for a stable address.
    unpark_buf: Box<u64>,
}

impl Driver {
    pub(crate) fn try_new(config: &RuntimeConfig, unpark: Unpark) -> io::Result<Self> {
        let ring = IoUring::builder()
            .setup_cqsize(config.ring_entries * 2)
            .build(config.ring_entries)?;
        let max_in_flight = (config.ring_entries * 2) as usize;
        Ok(Self {
            ring,
            ops: Slab::with_capacity(max_in_flight),
            max_in_flight,
            unpark,
            unpark_armed: false,
            unpark_buf: Box::new(0),
        })
    }

    /// Entries pushed but not yet submitted to the kernel.
    pub(crate) fn num_unsubmitted(&mut self) -> usize {
        self.ring.submission().len()
    }

    /// Submits one operation, transferring buffer ownership into a shared
    /// record. An optional deadline registers a cancel entry with the
    /// worker's timer.
    pub(crate) fn submit<P: Payload>(
        &mut self,
        payload: P,
        deadline: Option<Instant>,
        timer: &mut Timer,
    ) -> io::Result<Arc<OpCell<P>>> {
        if self.ops.len() >= self.max_in_flight {
            // Try to reap completions before giving up.
            self.flush()?;
            self.process_completions();
            if self.ops.len() >= self.max_in_flight {
                return Err(io::Error::other(DriverError::NoSubmissionSlot));
            }
        }

        let key = self.ops.vacant_key();
        let deadline_timer = deadline.map(|at| timer.insert_cancel(at, key));
        let cell = Arc::new(OpCell::new(payload, key, deadline_timer));
        // Safety: the record is not shared until after this call.
        let entry = unsafe { cell.payload_mut() }.entry().user_data(key as u64);
        self.push_entry(entry)?;

        let inserted = self.ops.insert(cell.clone());
        debug_assert_eq!(inserted, key);
        Ok(cell)
    }

    /// Pushes an entry, flushing once if the submission queue is full.
    fn push_entry(&mut self, entry: squeue::Entry) -> io::Result<()> {
        if unsafe { self.ring.submission().push(&entry) }.is_ok() {
            return Ok(());
        }
        self.flush()?;
        unsafe { self.ring.submission().push(&entry) }
            .map_err(|_| io::Error::other(DriverError::NoSubmissionSlot))
    }

    /// Requests cancellation of the in-flight operation under `key`. The
    /// cancelled operation still completes, with `-ECANCELED` on success.
    pub(crate) fn push_cancel(&mut self, key: usize) {
        if !self.ops.contains(key) {
            return;
        }
        let entry = opcode::AsyncCancel::new(key as u64)
            .build()
            .user_data(TOKEN_IGNORE);
        if let Err(err) = self.push_entry(entry) {
            log::warn!("failed to push cancellation for op {key}: {err}");
        }
    }

    pub(crate) fn flush(&mut self) -> io::Result<usize> {
        self.ring.submission().sync();
        match self.ring.submitter().submit() {
            Ok(n) => Ok(n),
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Drains the completion queue, resolving finished operations. Returns
    /// the number of operation completions processed.
    pub(crate) fn process_completions(&mut self) -> usize {
        let mut count = 0;
        let mut unparked = false;
        {
            let mut cq = self.ring.completion();
            cq.sync();
            for cqe in &mut cq {
                match cqe.user_data() {
                    TOKEN_UNPARK => unparked = true,
                    TOKEN_IGNORE => {}
                    key => {
                        let key = key as usize;
                        if self.ops.contains(key) {
                            let record = self.ops.remove(key);
                            record.complete(cqe.result());
                            count += 1;
                        } else {
                            log::warn!("completion for unknown op {key}");
                        }
                    }
                }
            }
        }
        if unparked {
            self.unpark_armed = false;
        }
        count
    }

    /// Flushes submissions and reaps any ready completions without blocking.
    pub(crate) fn poll(&mut self) -> io::Result<bool> {
        self.flush()?;
        Ok(self.process_completions() > 0)
    }

    /// Blocks until at least one completion arrives, the timeout expires, or
    /// another thread writes the unpark eventfd.
    pub(crate) fn park(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.arm_unpark()?;
        self.ring.submission().sync();

        let result = match timeout {
            Some(timeout) => {
                let ts = Timespec::from(timeout);
                let args = SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args)
            }
            None => self.ring.submitter().submit_and_wait(1),
        };
        match result {
            Ok(_) => {}
            // ETIME is the wait timeout firing; EINTR is a signal. Both are
            // normal wakeups.
            Err(err)
                if matches!(err.raw_os_error(), Some(libc::ETIME) | Some(libc::EINTR)) => {}
            Err(err) => return Err(err),
        }

        self.process_completions();
        Ok(())
    }

    /// Keeps a read of the unpark eventfd in flight while parked.
    fn arm_unpark(&mut self) -> io::Result<()> {
        if self.unpark_armed {
            return Ok(());
        }
        let entry = opcode::Read::new(
            types::Fd(self.unpark.as_raw_fd()),
            &mut *self.unpark_buf as *mut u64 as *mut u8,
            std::mem::size_of::<u64>() as u32,
        )
        .build()
        .user_data(TOKEN_UNPARK);
        self.push_entry(entry)?;
        self.unpark_armed = true;
        Ok(())
    }

    /// Tears the reactor down. Dropping the ring first waits out in-flight
    /// operations, so the buffers owned by the remaining records are no
    /// longer kernel-visible when they are freed.
    pub(crate) fn shutdown(self) {
        let Driver { ring, mut ops, .. } = self;
        drop(ring);
        ops.clear();
    }
}
