//! Burst continuation: handing a queued job to a worker that is still
//! connected to the same host, instead of spawning a new connection.
//!
//! ```text
//!        ┌──────┐ wants_burst  ┌───────────────────────┐ token sent ┌──────────────────┐
//!        │ Idle │─────────────▶│ RequestedContinuation │───────────▶│ AwaitingSlotFill │
//!        └──────┘              └───────────────────────┘            └──────────────────┘
//!                                         ▲                            │            │
//!                                         │ job has no files           │ filled     │ bound
//!                                         │                            ▼            ▼
//!                                         │                     ┌────────────┐ ┌──────────┐
//!                                         └─────────────────────│ SlotFilled │ │ TimedOut │
//!                                                               └────────────┘ └──────────┘
//! ```
//!
//! The dispatcher clears the slot's rendezvous byte, sends `-pid` on the
//! control channel, then polls the slot. The worker answers by filling the
//! slot ([`accept_burst_job`]). The loop back for empty jobs is capped by
//! [`BurstConfig::max_iterations`].

use std::time::Duration;

use crate::area::StatusArea;
use crate::config::BurstConfig;
use crate::control::{ControlRx, ControlToken, ControlTx};
use crate::error::{Result, StatusError};
use crate::fsa::{HostStatus, MAX_NO_PARALLEL_JOBS};
use crate::job::{JobDescriptor, JobStore};
use crate::record::{ConnectStatus, JobStatusSlot};
use crate::wait::{Deadline, poll_until};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstState {
    Idle,
    RequestedContinuation,
    AwaitingSlotFill,
    SlotFilled,
    TimedOut,
}

/// Which worker to continue, and what it was last known to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstRequest {
    /// Index of the destination host in the FSA.
    pub host: usize,
    /// The worker's job status slot inside that host record.
    pub slot: usize,
    pub worker_pid: i32,
    /// Job id the dispatcher last saw in this slot.
    pub known_job_id: u32,
}

/// A worker accepted a job that has files to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    /// Freshly loaded from the job store.
    pub job: JobDescriptor,
    pub unique_name: String,
    pub pending_files: usize,
    /// The worker moved on to a different job id than `known_job_id`.
    pub job_changed: bool,
    /// Continuation requests it took, including this one.
    pub iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BurstOutcome {
    Continued(Continuation),
    /// The worker never filled its slot; spawn a fresh worker later.
    TimedOut,
    /// Every accepted job was empty, `iterations` times in a row.
    Exhausted { iterations: u32 },
}

/// Dispatcher-side state machine for one worker slot.
#[derive(Debug)]
pub struct BurstContinuation {
    config: BurstConfig,
    state: BurstState,
}

impl BurstContinuation {
    pub fn new(config: BurstConfig) -> Self {
        Self {
            config,
            state: BurstState::Idle,
        }
    }

    #[inline]
    pub fn state(&self) -> BurstState {
        self.state
    }

    /// Back to `Idle` after an outcome has been handled.
    pub fn reset(&mut self) {
        self.state = BurstState::Idle;
    }

    /// The dispatcher trigger: jobs are queued and every transfer slot of the
    /// host is busy.
    #[inline]
    pub fn should_request(host: &HostStatus) -> bool {
        host.wants_burst()
    }

    /// Ask the worker in `request` to continue, and wait for it.
    ///
    /// A control-channel failure aborts this cycle only and surfaces as a
    /// retry-class error; the state returns to `Idle`.
    pub fn run<S: JobStore>(
        &mut self,
        area: &StatusArea<HostStatus>,
        control: &mut ControlTx,
        store: &S,
        request: &BurstRequest,
    ) -> Result<BurstOutcome> {
        let result = self.cycle(area, control, store, request);
        if let Err(e) = &result {
            warn!(
                host = request.host,
                slot = request.slot,
                pid = request.worker_pid,
                error = %e,
                "burst continuation aborted"
            );
            self.state = BurstState::Idle;
        }
        result
    }

    fn cycle<S: JobStore>(
        &mut self,
        area: &StatusArea<HostStatus>,
        control: &mut ControlTx,
        store: &S,
        request: &BurstRequest,
    ) -> Result<BurstOutcome> {
        if request.slot >= MAX_NO_PARALLEL_JOBS {
            return Err(StatusError::RecordOutOfRange {
                index: request.slot,
                capacity: MAX_NO_PARALLEL_JOBS,
            });
        }

        let mut known_job_id = request.known_job_id;
        for iteration in 1..=self.config.max_iterations {
            self.state = BurstState::RequestedContinuation;
            area.update(request.host, |host| {
                host.job_status[request.slot].clear_unique_name();
            })?;
            control.send(ControlToken::ContinueBurst {
                pid: request.worker_pid,
            })?;

            self.state = BurstState::AwaitingSlotFill;
            debug!(host = request.host, slot = request.slot, iteration, "awaiting slot fill");
            let Some(slot) = self.await_fill(area, request)? else {
                self.state = BurstState::TimedOut;
                warn!(
                    host = request.host,
                    slot = request.slot,
                    pid = request.worker_pid,
                    waited = ?self.config.max_wait,
                    "worker did not fill its job slot"
                );
                return Ok(BurstOutcome::TimedOut);
            };

            self.state = BurstState::SlotFilled;
            let job_changed = slot.job_id != known_job_id;
            known_job_id = slot.job_id;

            // The slot only carries identity; never trust an older copy of
            // the descriptor.
            let job = store.load_job(slot.job_id)?;
            let unique_name = slot.unique_name().into_owned();
            let pending_files = store.pending_files(&unique_name)?;

            if pending_files == 0 {
                debug!(
                    job_id = slot.job_id,
                    %unique_name,
                    "continued job has nothing to send, asking again"
                );
                continue;
            }

            info!(
                host = request.host,
                job_id = slot.job_id,
                %unique_name,
                pending_files,
                job_changed,
                "burst continued"
            );
            return Ok(BurstOutcome::Continued(Continuation {
                job,
                unique_name,
                pending_files,
                job_changed,
                iterations: iteration,
            }));
        }

        self.state = BurstState::Idle;
        warn!(
            host = request.host,
            iterations = self.config.max_iterations,
            "burst continuation kept yielding empty jobs, giving up"
        );
        Ok(BurstOutcome::Exhausted {
            iterations: self.config.max_iterations,
        })
    }

    fn await_fill(
        &self,
        area: &StatusArea<HostStatus>,
        request: &BurstRequest,
    ) -> Result<Option<JobStatusSlot>> {
        // the cheap unlocked read only spots the flag; the slot is taken from
        // a locked re-read so job id and name belong to the same fill
        let polled = poll_until(self.config.poll_interval, self.config.max_wait, || {
            match area.job_slot(request.host, request.slot) {
                Ok(slot) if slot.is_filled() => {
                    match area.locked_job_slot(request.host, request.slot) {
                        Ok(slot) if slot.is_filled() => Some(Ok(slot)),
                        Ok(_) => None,
                        Err(e) => Some(Err(e)),
                    }
                }
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        });
        match polled {
            Ok(slot) => slot.map(Some),
            Err(_) => Ok(None),
        }
    }
}

/// Worker side: announce the job this worker has picked up by filling its
/// slot under the host's record lock.
pub fn accept_burst_job(
    area: &StatusArea<HostStatus>,
    host: usize,
    slot: usize,
    job_id: u32,
    unique_name: &str,
    pid: i32,
) -> Result<()> {
    if slot >= MAX_NO_PARALLEL_JOBS {
        return Err(StatusError::RecordOutOfRange {
            index: slot,
            capacity: MAX_NO_PARALLEL_JOBS,
        });
    }
    if unique_name.is_empty() {
        return Err(StatusError::Protocol("empty unique name".into()));
    }
    area.update(host, |record| {
        let entry = &mut record.job_status[slot];
        entry.fill(job_id, unique_name, pid);
        entry.connect_status = ConnectStatus::Burst as u8;
    })?;
    trace!(host, slot, job_id, unique_name, "filled job slot");
    Ok(())
}

/// Worker side: wait up to `timeout` for a continuation request addressed to
/// `pid`. Tokens for other workers are skipped.
pub fn await_burst_request(rx: &mut ControlRx, pid: i32, timeout: Duration) -> Result<bool> {
    let deadline = Deadline::after(timeout);
    loop {
        let remaining = deadline.remaining();
        match rx.recv_timeout(remaining)? {
            Some(ControlToken::ContinueBurst { pid: p }) if p == pid => return Ok(true),
            Some(other) => trace!(?other, pid, "ignoring control token for another worker"),
            None => return Ok(false),
        }
    }
}
