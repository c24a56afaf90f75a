//! Numbered-step protocol engine.
//!
//! A codec describes its protocol as a handler over step indices. The
//! sequencer calls it with 0, 1, 2, ... until the handler either parks the
//! sequence with [`StepControl::stop`] to wait for the device, or returns
//! `false` to end it. Waiting never blocks: [`StepSequencer::run`] returns
//! and is called again once an inbound packet resumes the sequence.

use tracing::{debug, error};

/// Consecutive steps a single run may execute before it is declared stuck
pub const MAX_STEPS_PER_RUN: usize = 256;

/// Step bookkeeping the handler manipulates while it runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepControl {
    next: usize,
    current: Option<usize>,
    waiting: bool,
    finished: bool,
}

impl StepControl {
    /// Fresh control positioned before step 0
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the sequence until [`resume`](Self::resume) is called
    pub fn stop(&mut self) {
        self.waiting = true;
    }

    /// Continue with the next step
    pub fn resume(&mut self) {
        self.waiting = false;
    }

    /// Continue at `step`
    pub fn resume_at(&mut self, step: usize) {
        self.next = step;
        self.waiting = false;
    }

    /// Make `step` the next one to run, leaving the wait flag alone
    pub fn jump_to(&mut self, step: usize) {
        self.next = step;
    }

    /// Jump only while the sequence sits at `only_if_at`. Returns whether it jumped.
    pub fn jump_to_if(&mut self, step: usize, only_if_at: usize) -> bool {
        if self.current == Some(only_if_at) {
            self.next = step;
            true
        } else {
            false
        }
    }

    /// Run the current step again on resume
    pub fn retry_current(&mut self) {
        if let Some(current) = self.current {
            self.next = current;
        }
    }

    /// End the sequence; no further step runs
    pub fn finish(&mut self) {
        self.finished = true;
    }

    /// Step that ran last, `None` before the first one
    #[must_use]
    pub const fn current(&self) -> Option<usize> {
        self.current
    }

    /// Step that runs next
    #[must_use]
    pub const fn next(&self) -> usize {
        self.next
    }

    /// Whether the sequence waits for the device
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        self.waiting
    }

    /// Whether the sequence has ended
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Outcome of one [`StepSequencer::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    /// Parked, waiting for a device reply
    Waiting,
    /// Ended; the session should disconnect
    Finished,
}

/// Drives a [`StepControl`] through a step handler
#[derive(Debug, Default)]
pub struct StepSequencer {
    control: StepControl,
}

impl StepSequencer {
    /// Sequencer positioned before step 0
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current step bookkeeping
    #[must_use]
    pub const fn control(&self) -> &StepControl {
        &self.control
    }

    /// Mutable step bookkeeping, for decode paths that resume or redirect
    pub fn control_mut(&mut self) -> &mut StepControl {
        &mut self.control
    }

    /// Execute steps until the handler parks or ends the sequence.
    ///
    /// The handler gets each step index and the control; returning `false`
    /// ends the sequence. A run that executes [`MAX_STEPS_PER_RUN`] steps
    /// without parking is ended as well.
    pub fn run<F>(&mut self, mut handler: F) -> SequencerState
    where
        F: FnMut(usize, &mut StepControl) -> bool,
    {
        let mut executed = 0;

        while !self.control.waiting && !self.control.finished {
            if executed == MAX_STEPS_PER_RUN {
                error!(
                    "Step sequence ran {} steps without waiting, ending it at step {}",
                    MAX_STEPS_PER_RUN, self.control.next
                );
                self.control.finished = true;
                break;
            }

            let step = self.control.next;
            self.control.current = Some(step);
            self.control.next = step + 1;
            executed += 1;

            debug!("Running step {}", step);
            if !handler(step, &mut self.control) {
                debug!("Step sequence ended at step {}", step);
                self.control.finished = true;
            }
        }

        if self.control.finished {
            SequencerState::Finished
        } else {
            SequencerState::Waiting
        }
    }
}

/// Bounded retry counter for one kind of unexpected reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    limit: u32,
    used: u32,
}

impl RetryBudget {
    /// Budget allowing `limit` retries
    #[must_use]
    pub const fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// Consume one retry. Returns `false` once the budget is spent.
    pub fn try_again(&mut self) -> bool {
        if self.used < self.limit {
            self.used += 1;
            true
        } else {
            false
        }
    }

    /// Retries consumed so far
    #[must_use]
    pub const fn used(&self) -> u32 {
        self.used
    }

    /// Whether no retry is left
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }

    /// Restore the full budget
    pub fn reset(&mut self) {
        self.used = 0;
    }
}
