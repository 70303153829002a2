//! Counter authority for raft indices and order numbers.
//!
//! A `Counter` holds the *next* value to issue. It is never shared on its own: each one lives
//! inside a [`crate::domain::LogDomain`] next to the log it numbers, so issuing a value and
//! appending the record that carries it happen under the same lock.

/// How a follower moves its counter when it receives a replicated record.
#[derive(clap::ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FollowerCounterRule {
    /// Set the counter to `key + 1` unconditionally. Last writer wins, so a late, out-of-order
    /// delivery can move the counter backwards.
    #[default]
    Overwrite,
    /// Only move the counter forwards.
    Max,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counter {
    next: u64,
}

impl Counter {
    pub fn starting_at(next: u64) -> Self {
        Self { next }
    }

    /// `last + 1`, or 0 when the log is empty or absent.
    pub fn from_last_key(last: Option<u64>) -> Self {
        Self {
            next: last.map_or(0, |k| k.saturating_add(1)),
        }
    }

    /// Returns the current value and advances. Values start at 0 and are never reused.
    ///
    /// `None` once the key space is used up; `u64::MAX` itself is never issued.
    pub fn issue(&mut self) -> Option<u64> {
        let issued = self.next;
        self.next = issued.checked_add(1)?;
        Some(issued)
    }

    pub fn next(&self) -> u64 {
        self.next
    }

    /// Last issued value clamped at zero. "Nothing issued" and "0 issued" both read as 0; use
    /// [`Counter::last_issued`] where the difference matters.
    pub fn latest(&self) -> u64 {
        self.next.saturating_sub(1)
    }

    pub fn last_issued(&self) -> Option<u64> {
        self.next.checked_sub(1)
    }

    pub fn observe_replicated(&mut self, key: u64, rule: FollowerCounterRule) {
        let candidate = key.saturating_add(1);
        self.next = match rule {
            FollowerCounterRule::Overwrite => candidate,
            FollowerCounterRule::Max => self.next.max(candidate),
        };
    }

    /// Steps back by one when `n` is exactly the next value to issue. Returns whether it did.
    pub fn rollback_if_next(&mut self, n: u64) -> bool {
        if n == self.next && self.next > 0 {
            self.next -= 1;
            true
        } else {
            false
        }
    }
}
