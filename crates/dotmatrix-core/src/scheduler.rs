use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use log::trace;

/// Returned by [`Scheduler::cycles_until_next_event`] when the queue is empty.
pub const NO_EVENT: u64 = u64::MAX;

/// Kinds of events that can sit in the queue.
///
/// The set is closed: each component owns fixed kinds, and [`Scheduler::deschedule`]
/// removes by kind. The APU kinds are reserved for the audio unit, which lives
/// outside this crate as an event sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    VBlank,
    HBlank,
    OamScan,
    LcdTransfer,
    TimerOverflow,
    ApuChannel1,
    ApuChannel2,
    ApuChannel3,
    ApuChannel4,
    ApuFrameSequencer,
    Dma,
    Joypad,
}

/// Action invoked when its event fires.
///
/// Taken by value at schedule time; the scheduler is passed back in so an
/// action can schedule follow-up events (which may fire within the same
/// [`Scheduler::process_events`] call when their fire cycle is already due).
pub type EventAction = Box<dyn FnOnce(&mut Scheduler)>;

struct Event {
    fire_at_cycle: u64,
    /// Insertion sequence. Events with equal fire cycles pop in insertion
    /// order, keeping tie-breaks deterministic per run.
    seq: u64,
    kind: EventKind,
    action: EventAction,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at_cycle == other.fire_at_cycle && self.seq == other.seq
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.fire_at_cycle, self.seq).cmp(&(other.fire_at_cycle, other.seq))
    }
}

/// Monotonic cycle counter plus a min-heap of future events keyed by absolute
/// fire cycle.
///
/// `fire_at_cycle >= current_cycle` is not guaranteed: the clock is advanced
/// in instruction-sized steps, so an event can end up slightly in the past and
/// is then processed promptly by the next [`Scheduler::process_events`].
pub struct Scheduler {
    current_cycle: u64,
    queue: BinaryHeap<Reverse<Event>>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            current_cycle: 0,
            queue: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn current_cycle(&self) -> u64 {
        self.current_cycle
    }

    /// Insert an event firing `delta_cycles` from now.
    pub fn schedule(&mut self, kind: EventKind, delta_cycles: u64, action: EventAction) {
        let fire_at_cycle = self.current_cycle + delta_cycles;
        trace!("schedule {kind:?} to fire at cycle {fire_at_cycle}");
        self.queue.push(Reverse(Event {
            fire_at_cycle,
            seq: self.next_seq,
            kind,
            action,
        }));
        self.next_seq += 1;
    }

    /// Remove every queued event of the given kind, preserving the rest.
    pub fn deschedule(&mut self, kind: EventKind) {
        self.queue.retain(|Reverse(ev)| ev.kind != kind);
        trace!("descheduled all events of kind {kind:?}");
    }

    /// Advance the clock. Does not fire anything.
    pub fn advance(&mut self, cycles: u64) {
        self.current_cycle += cycles;
    }

    /// Pop and invoke the head while it is due.
    pub fn process_events(&mut self) {
        while self
            .queue
            .peek()
            .is_some_and(|Reverse(ev)| ev.fire_at_cycle <= self.current_cycle)
        {
            let Some(Reverse(ev)) = self.queue.pop() else {
                break;
            };
            trace!("processing {:?} at cycle {}", ev.kind, self.current_cycle);
            (ev.action)(self);
        }
    }

    /// Distance to the next event: 0 when the head is already due,
    /// [`NO_EVENT`] when the queue is empty.
    pub fn cycles_until_next_event(&self) -> u64 {
        match self.queue.peek() {
            None => NO_EVENT,
            Some(Reverse(ev)) => ev.fire_at_cycle.saturating_sub(self.current_cycle),
        }
    }

    /// Clear the queue and zero the clock.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.current_cycle = 0;
        self.next_seq = 0;
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
