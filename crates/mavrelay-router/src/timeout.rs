//! Fixed-capacity registry of one-shot and repeating timeouts.
//!
//! Slots live in an index-stable arena addressed by generation-checked
//! handles. Cancelling only marks a slot; marked slots are reclaimed by a
//! sweep that never runs while callbacks are being dispatched, so a
//! callback may cancel itself or any sibling.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{Result, RouterError};

/// Slots available when no capacity is configured.
pub const DEFAULT_TIMEOUT_CAPACITY: usize = 5;

/// Identifies one scheduled timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutHandle {
    index: u32,
    generation: u32,
}

/// What to do with a timeout after its callback ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Fire again one interval later.
    Rearm,
    /// Remove the timeout.
    Done,
}

/// Handed to a running callback so it can cancel timeouts, itself included.
#[derive(Debug)]
pub struct TimeoutControl {
    current: TimeoutHandle,
    cancelled: Vec<TimeoutHandle>,
}

impl TimeoutControl {
    /// Handle of the timeout whose callback is running.
    pub fn current(&self) -> TimeoutHandle {
        self.current
    }

    /// Cancel `handle`. It will not fire again, not even later in this pass.
    pub fn cancel(&mut self, handle: TimeoutHandle) {
        self.cancelled.push(handle);
    }
}

/// Callback invoked with the loop's context when a timeout is due.
pub type TimeoutCallback<C> = Box<dyn FnMut(&mut C, &mut TimeoutControl) -> TimeoutAction>;

struct Timer<C> {
    interval: Duration,
    deadline: Instant,
    seq: u64,
    callback: Option<TimeoutCallback<C>>,
}

enum SlotState<C> {
    Free,
    Live(Timer<C>),
    Removed,
}

struct Slot<C> {
    generation: u32,
    state: SlotState<C>,
}

pub struct TimeoutRegistry<C> {
    slots: Vec<Slot<C>>,
    next_seq: u64,
}

impl<C> TimeoutRegistry<C> {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                state: SlotState::Free,
            })
            .collect();
        Self { slots, next_seq: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Timeouts that will still fire.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.state, SlotState::Live(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Schedule `callback` to run `interval` after `now`.
    ///
    /// Fails with [`RouterError::CapacityExceeded`] when every slot is live.
    pub fn schedule(
        &mut self,
        now: Instant,
        interval: Duration,
        callback: TimeoutCallback<C>,
    ) -> Result<TimeoutHandle> {
        self.sweep();
        let capacity = self.slots.len();
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| matches!(slot.state, SlotState::Free))
            .ok_or(RouterError::CapacityExceeded { capacity })?;

        slot.state = SlotState::Live(Timer {
            interval,
            deadline: now + interval,
            seq: self.next_seq,
            callback: Some(callback),
        });
        self.next_seq += 1;

        let handle = TimeoutHandle {
            index: index as u32,
            generation: slot.generation,
        };
        trace!(slot = index, ?interval, "timeout scheduled");
        Ok(handle)
    }

    /// Mark `handle` for removal. Returns false when it was already gone.
    pub fn cancel(&mut self, handle: TimeoutHandle) -> bool {
        match self.slots.get_mut(handle.index as usize) {
            Some(slot)
                if slot.generation == handle.generation
                    && matches!(slot.state, SlotState::Live(_)) =>
            {
                slot.state = SlotState::Removed;
                true
            }
            _ => false,
        }
    }

    pub fn is_scheduled(&self, handle: TimeoutHandle) -> bool {
        self.slots.get(handle.index as usize).is_some_and(|slot| {
            slot.generation == handle.generation && matches!(slot.state, SlotState::Live(_))
        })
    }

    /// Earliest deadline among live timeouts.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter_map(|slot| match &slot.state {
                SlotState::Live(timer) => Some(timer.deadline),
                _ => None,
            })
            .min()
    }

    /// How long the loop may sleep before the next timeout is due.
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Run every timeout due at `now`, earliest deadline first, then sweep.
    ///
    /// Returns how many callbacks ran.
    pub fn run_due(&mut self, now: Instant, ctx: &mut C) -> usize {
        let mut due: Vec<(Instant, u64, usize)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.state {
                SlotState::Live(timer) if timer.deadline <= now => {
                    Some((timer.deadline, timer.seq, index))
                }
                _ => None,
            })
            .collect();
        due.sort_unstable();

        let mut fired = 0;
        for (_, _, index) in due {
            let slot = &mut self.slots[index];
            let SlotState::Live(timer) = &mut slot.state else {
                continue;
            };
            let Some(mut callback) = timer.callback.take() else {
                continue;
            };
            let mut control = TimeoutControl {
                current: TimeoutHandle {
                    index: index as u32,
                    generation: slot.generation,
                },
                cancelled: Vec::new(),
            };

            let action = callback(ctx, &mut control);
            fired += 1;

            let slot = &mut self.slots[index];
            let done = match &mut slot.state {
                SlotState::Live(timer) if action == TimeoutAction::Rearm => {
                    timer.callback = Some(callback);
                    timer.deadline += timer.interval;
                    if timer.deadline <= now {
                        timer.deadline = now + timer.interval;
                    }
                    false
                }
                SlotState::Live(_) => true,
                _ => false,
            };
            if done {
                slot.state = SlotState::Removed;
            }
            for handle in control.cancelled {
                self.cancel(handle);
            }
        }

        self.sweep();
        fired
    }

    /// Free every slot marked for removal.
    fn sweep(&mut self) {
        for slot in &mut self.slots {
            if matches!(slot.state, SlotState::Removed) {
                slot.state = SlotState::Free;
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
    }
}

impl<C> Default for TimeoutRegistry<C> {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_CAPACITY)
    }
}

impl<C> fmt::Debug for TimeoutRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutRegistry")
            .field("capacity", &self.slots.len())
            .field("live", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        fired: Vec<u64>,
        victim: Option<TimeoutHandle>,
    }

    fn record(tag: u64) -> TimeoutCallback<Recorder> {
        Box::new(move |ctx: &mut Recorder, _: &mut TimeoutControl| {
            ctx.fired.push(tag);
            TimeoutAction::Done
        })
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn fires_in_deadline_order() {
        let start = Instant::now();
        let mut registry = TimeoutRegistry::default();
        for interval in [50, 10, 30] {
            registry.schedule(start, ms(interval), record(interval)).unwrap();
        }

        let mut ctx = Recorder::default();
        assert_eq!(registry.run_due(start + ms(5), &mut ctx), 0);
        assert_eq!(registry.run_due(start + ms(60), &mut ctx), 3);
        assert_eq!(ctx.fired, vec![10, 30, 50]);
        assert!(registry.is_empty());
    }

    #[test]
    fn sibling_cancelled_from_callback_never_fires() {
        let start = Instant::now();
        let mut registry = TimeoutRegistry::default();
        let mut ctx = Recorder::default();

        registry.schedule(start, ms(50), record(50)).unwrap();
        registry
            .schedule(
                start,
                ms(10),
                Box::new(|ctx: &mut Recorder, control: &mut TimeoutControl| {
                    ctx.fired.push(10);
                    if let Some(victim) = ctx.victim {
                        control.cancel(victim);
                    }
                    TimeoutAction::Done
                }),
            )
            .unwrap();
        ctx.victim = Some(registry.schedule(start, ms(30), record(30)).unwrap());

        registry.run_due(start + ms(60), &mut ctx);
        registry.run_due(start + ms(500), &mut ctx);
        assert_eq!(ctx.fired, vec![10, 50]);
    }

    #[test]
    fn callback_can_cancel_itself() {
        let start = Instant::now();
        let mut registry = TimeoutRegistry::default();
        let handle = registry
            .schedule(
                start,
                ms(10),
                Box::new(|ctx: &mut Recorder, control: &mut TimeoutControl| {
                    ctx.fired.push(1);
                    control.cancel(control.current());
                    TimeoutAction::Rearm
                }),
            )
            .unwrap();

        let mut ctx = Recorder::default();
        registry.run_due(start + ms(10), &mut ctx);
        registry.run_due(start + ms(100), &mut ctx);
        assert_eq!(ctx.fired, vec![1]);
        assert!(!registry.is_scheduled(handle));
    }

    #[test]
    fn repeating_timeout_rearms() {
        let start = Instant::now();
        let mut registry = TimeoutRegistry::default();
        registry
            .schedule(
                start,
                ms(10),
                Box::new(|ctx: &mut Recorder, _: &mut TimeoutControl| {
                    ctx.fired.push(1);
                    TimeoutAction::Rearm
                }),
            )
            .unwrap();

        let mut ctx = Recorder::default();
        registry.run_due(start + ms(10), &mut ctx);
        assert_eq!(registry.next_deadline(), Some(start + ms(20)));
        registry.run_due(start + ms(20), &mut ctx);
        // A stall longer than the interval does not queue up missed runs.
        registry.run_due(start + ms(95), &mut ctx);
        assert_eq!(ctx.fired.len(), 3);
        assert_eq!(registry.next_deadline(), Some(start + ms(105)));
    }

    #[test]
    fn capacity_is_enforced() {
        let start = Instant::now();
        let mut registry: TimeoutRegistry<Recorder> = TimeoutRegistry::default();
        let handles: Vec<TimeoutHandle> = (0..DEFAULT_TIMEOUT_CAPACITY as u64)
            .map(|i| registry.schedule(start, ms(i + 1), record(i)).unwrap())
            .collect();

        let err = registry.schedule(start, ms(1), record(99)).unwrap_err();
        assert!(matches!(
            err,
            RouterError::CapacityExceeded {
                capacity: DEFAULT_TIMEOUT_CAPACITY
            }
        ));

        assert!(registry.cancel(handles[2]));
        assert!(registry.schedule(start, ms(1), record(99)).is_ok());
        assert_eq!(registry.len(), DEFAULT_TIMEOUT_CAPACITY);
    }

    #[test]
    fn stale_handle_does_not_cancel_reused_slot() {
        let start = Instant::now();
        let mut registry: TimeoutRegistry<Recorder> = TimeoutRegistry::new(1);
        let old = registry.schedule(start, ms(1), record(1)).unwrap();
        assert!(registry.cancel(old));
        assert!(!registry.cancel(old));

        let new = registry.schedule(start, ms(1), record(2)).unwrap();
        assert_ne!(old, new);
        assert!(!registry.cancel(old));
        assert!(registry.is_scheduled(new));
    }

    #[test]
    fn wait_bound_tracks_earliest_deadline() {
        let start = Instant::now();
        let mut registry: TimeoutRegistry<Recorder> = TimeoutRegistry::default();
        assert_eq!(registry.time_until_next(start), None);

        registry.schedule(start, ms(40), record(40)).unwrap();
        let short = registry.schedule(start, ms(15), record(15)).unwrap();
        assert_eq!(registry.time_until_next(start), Some(ms(15)));
        assert_eq!(registry.time_until_next(start + ms(20)), Some(Duration::ZERO));

        registry.cancel(short);
        assert_eq!(registry.time_until_next(start), Some(ms(40)));
    }
}
