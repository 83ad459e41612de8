//! Bounded polling.
//!
//! Waits in the driver are counted in status-register polls, not time.
//! Protocol code only sees [`Timeout`] and [`Deadline`], so a clock-backed
//! source can replace [`IterationTimeout`] without touching it.

pub trait Deadline {
    /// Consumes one poll; `true` once the wait has run out.
    fn expired(&mut self) -> bool;
}

pub trait Timeout {
    type Deadline: Deadline;

    fn start(&self) -> Self::Deadline;
}

pub const DEFAULT_POLL_LIMIT: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationTimeout {
    pub limit: u32,
}

impl Default for IterationTimeout {
    fn default() -> Self {
        Self {
            limit: DEFAULT_POLL_LIMIT,
        }
    }
}

impl Timeout for IterationTimeout {
    type Deadline = Iterations;

    fn start(&self) -> Iterations {
        Iterations {
            remaining: self.limit,
        }
    }
}

#[derive(Debug)]
pub struct Iterations {
    remaining: u32,
}

impl Deadline for Iterations {
    fn expired(&mut self) -> bool {
        match self.remaining.checked_sub(1) {
            Some(remaining) => {
                self.remaining = remaining;
                false
            }
            None => true,
        }
    }
}
