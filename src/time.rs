// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Time and timer abstractions.
//!
//! The engine never reads a clock or arms a timer directly; it goes through
//! the [`InstantContext`] and [`TimerContext`] bindings traits. Production
//! bindings back these with the shard's reactor; tests use
//! [`testutil::FakeTimerCtx`] and drive time by hand.

use core::fmt::Debug;
use core::time::Duration;

/// A type representing an instant in time.
///
/// `Instant` can be implemented by any type which represents an instant in
/// time, including real-world clock time (e.g. [`std::time::Instant`]) or
/// fake time such as in testing.
pub trait Instant: Sized + Ord + Copy + Clone + Debug + Send + Sync + 'static {
    /// Returns the amount of time elapsed from another instant to this one.
    ///
    /// # Panics
    ///
    /// Panics if `earlier` is later than `self`.
    fn duration_since(&self, earlier: Self) -> Duration;

    /// Returns the amount of time elapsed from another instant to this one,
    /// saturating at zero.
    fn saturating_duration_since(&self, earlier: Self) -> Duration;

    /// Returns `Some(t)` where `t` is the time `self + duration` if `t` can
    /// be represented by the underlying type, `None` otherwise.
    fn checked_add(&self, duration: Duration) -> Option<Self>;

    /// Unwraps the result from `checked_add`.
    ///
    /// # Panics
    ///
    /// Panics if the addition makes the clock wrap around.
    fn add(&self, duration: Duration) -> Self {
        self.checked_add(duration).unwrap_or_else(|| {
            panic!("clock wraps around when adding {:?} to {:?}", duration, *self);
        })
    }
}

impl Instant for std::time::Instant {
    fn duration_since(&self, earlier: Self) -> Duration {
        std::time::Instant::duration_since(self, earlier)
    }

    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        std::time::Instant::saturating_duration_since(self, earlier)
    }

    fn checked_add(&self, duration: Duration) -> Option<Self> {
        std::time::Instant::checked_add(self, duration)
    }
}

/// A context that provides access to a monotonic clock.
pub trait InstantContext {
    /// The type of an instant in time.
    type Instant: Instant;

    /// Returns the current instant.
    ///
    /// `now` guarantees that two subsequent calls return monotonically
    /// non-decreasing values.
    fn now(&self) -> Self::Instant;
}

/// Identifies a timer dispatched back into the engine.
///
/// The engine arms at most one timer per id; rescheduling an armed id moves
/// its deadline. Bindings deliver expiry by calling
/// [`crate::ipv4::Ipv4Engine::handle_timer`] with the fired id.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TimerId {
    /// The reassembly cache's expiry sweep.
    ReassemblyExpiry,
    /// The ARP resolver's probe retransmit/expiry sweep.
    ArpRetry,
}

/// A context providing timer scheduling to the engine.
pub trait TimerContext: InstantContext {
    /// Schedules `id` to fire at or after `at`, replacing any previous
    /// deadline for the same id.
    ///
    /// Returns the previously scheduled instant, if `id` was armed.
    fn schedule_timer(&mut self, at: Self::Instant, id: TimerId) -> Option<Self::Instant>;

    /// Cancels `id`, returning its deadline if it was armed.
    fn cancel_timer(&mut self, id: TimerId) -> Option<Self::Instant>;

    /// Returns the deadline for `id` if it is armed.
    fn scheduled_instant(&self, id: TimerId) -> Option<Self::Instant>;
}

#[cfg(any(test, feature = "testutils"))]
pub(crate) mod testutil {
    use super::*;

    use std::collections::HashMap;
    use std::fmt::{self, Formatter};
    use std::ops;

    /// A fake implementation of `Instant` for use in testing.
    #[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
    pub struct FakeInstant {
        /// A `FakeInstant` is just an offset from some arbitrary epoch.
        pub offset: Duration,
    }

    impl From<Duration> for FakeInstant {
        fn from(offset: Duration) -> FakeInstant {
            FakeInstant { offset }
        }
    }

    impl Instant for FakeInstant {
        fn duration_since(&self, earlier: FakeInstant) -> Duration {
            self.offset.checked_sub(earlier.offset).unwrap()
        }

        fn saturating_duration_since(&self, earlier: FakeInstant) -> Duration {
            self.offset.saturating_sub(earlier.offset)
        }

        fn checked_add(&self, duration: Duration) -> Option<FakeInstant> {
            self.offset.checked_add(duration).map(|offset| FakeInstant { offset })
        }
    }

    impl ops::Add<Duration> for FakeInstant {
        type Output = FakeInstant;

        fn add(self, dur: Duration) -> FakeInstant {
            FakeInstant { offset: self.offset + dur }
        }
    }

    impl ops::Sub<FakeInstant> for FakeInstant {
        type Output = Duration;

        fn sub(self, other: FakeInstant) -> Duration {
            self.offset - other.offset
        }
    }

    impl Debug for FakeInstant {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self.offset)
        }
    }

    /// A fake [`TimerContext`] holding a [`FakeInstant`] clock and the set of
    /// armed timers.
    #[derive(Default)]
    pub struct FakeTimerCtx {
        /// The current fake time.
        pub time: FakeInstant,
        timers: HashMap<TimerId, FakeInstant>,
    }

    impl FakeTimerCtx {
        /// Advances the fake clock by `dur`.
        pub fn sleep(&mut self, dur: Duration) {
            self.time.offset += dur;
        }

        /// Removes and returns one timer whose deadline has passed, if any.
        ///
        /// Tests dispatch the returned id into the engine, mimicking the
        /// bindings' expiry delivery.
        pub fn pop_due_timer(&mut self) -> Option<TimerId> {
            let due =
                self.timers.iter().find_map(|(id, at)| (*at <= self.time).then_some(*id))?;
            let _: Option<FakeInstant> = self.timers.remove(&due);
            Some(due)
        }
    }

    impl InstantContext for FakeTimerCtx {
        type Instant = FakeInstant;

        fn now(&self) -> FakeInstant {
            self.time
        }
    }

    impl TimerContext for FakeTimerCtx {
        fn schedule_timer(&mut self, at: FakeInstant, id: TimerId) -> Option<FakeInstant> {
            self.timers.insert(id, at)
        }

        fn cancel_timer(&mut self, id: TimerId) -> Option<FakeInstant> {
            self.timers.remove(&id)
        }

        fn scheduled_instant(&self, id: TimerId) -> Option<FakeInstant> {
            self.timers.get(&id).copied()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn fake_timer_schedule_and_fire() {
            let mut ctx = FakeTimerCtx::default();
            assert_eq!(ctx.scheduled_instant(TimerId::ArpRetry), None);
            assert_eq!(
                ctx.schedule_timer(ctx.now().add(Duration::from_secs(1)), TimerId::ArpRetry),
                None
            );
            assert_eq!(ctx.pop_due_timer(), None);
            ctx.sleep(Duration::from_secs(1));
            assert_eq!(ctx.pop_due_timer(), Some(TimerId::ArpRetry));
            assert_eq!(ctx.pop_due_timer(), None);
        }
    }
}
