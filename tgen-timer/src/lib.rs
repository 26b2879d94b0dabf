//! A lazy-deletion timer service over a binary min-heap.
//!
//! Timers are owned through a [`TimerHandle`] embedded in the owner object
//! (a flow). Stopping or rescheduling a timer to an earlier deadline never
//! touches the heap; the old node is marked dead and reclaimed when it
//! surfaces at the top. Rescheduling to a later deadline is a plain field
//! write, resolved the same way. The invariant throughout: a handle has at
//! most one live node.
//!
//! The classic intrusive handle<->node pointer pair is modelled as an arena
//! index plus a generation counter, so a stale handle simply reads as
//! unarmed instead of aliasing freed memory.

use std::{cmp::Reverse, collections::BinaryHeap, fmt};

use serde::Serialize;
use tgen_common::Dsec;
use tracing::trace;

/// Identity of one arena node. A `NodeId` is only meaningful while the
/// slot's generation matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeId {
    index: u32,
    gen: u32,
}

/// Per-owner timer state, embedded by value in the owning object.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerHandle {
    node: Option<NodeId>,
}

impl TimerHandle {
    pub const fn new() -> Self {
        Self { node: None }
    }
}

#[derive(Debug)]
enum SlotState<T> {
    Free,
    /// `sched` is the deadline the heap entry was pushed with; `updated`
    /// carries a pending later reschedule, applied when the entry surfaces.
    Armed { sched: Dsec, updated: Dsec, payload: T },
    /// Stopped or superseded; reclaimed lazily.
    Dead,
}

#[derive(Debug)]
struct Slot<T> {
    gen: u32,
    state: SlotState<T>,
}

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    time: Dsec,
    id: NodeId,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time
            .total_cmp(&other.time)
            .then_with(|| self.id.index.cmp(&other.id.index))
    }
}

/// Node lifecycle counters, dumped with the owner's stats.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TimerWheelCounters {
    pub st_alloc: u64,
    pub st_free: u64,
    pub st_start: u64,
    pub st_stop: u64,
    pub st_handle: u64,
}

impl fmt::Display for TimerWheelCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, " st_alloc  : {}", self.st_alloc)?;
        writeln!(f, " st_free   : {}", self.st_free)?;
        writeln!(f, " st_start  : {}", self.st_start)?;
        writeln!(f, " st_stop   : {}", self.st_stop)?;
        writeln!(f, " st_handle : {}", self.st_handle)
    }
}

/// The timer wheel. `T` is the payload handed back when a timer fires,
/// typically the owner's key in some table.
#[derive(Debug)]
pub struct TimerWheel<T: Copy> {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    counters: TimerWheelCounters,
}

impl<T: Copy> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> TimerWheel<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            counters: TimerWheelCounters::default(),
        }
    }

    /// Arms or re-arms the handle's timer for `time`.
    ///
    /// Unarmed handles allocate a node. Moving an armed timer later is a
    /// field write; moving it earlier kills the old node and pays for a new
    /// allocation.
    pub fn restart_timer(&mut self, handle: &mut TimerHandle, time: Dsec, payload: T) {
        self.counters.st_start += 1;
        if let Some(index) = self.live_index(handle) {
            let slot = &mut self.slots[index as usize];
            if let SlotState::Armed { sched, updated, .. } = &mut slot.state {
                if time >= *sched {
                    *updated = time;
                    return;
                }
            }
            slot.state = SlotState::Dead;
        }
        handle.node = Some(self.alloc_node(time, payload));
    }

    /// Disarms the handle. The node, if any, stays in the heap as dead
    /// weight until it surfaces.
    pub fn stop_timer(&mut self, handle: &mut TimerHandle) {
        if let Some(index) = self.live_index(handle) {
            self.counters.st_stop += 1;
            self.slots[index as usize].state = SlotState::Dead;
        }
        handle.node = None;
    }

    /// Whether the handle currently owns a live node.
    pub fn is_armed(&self, handle: &TimerHandle) -> bool {
        self.live_index(handle).is_some()
    }

    /// Earliest deadline among armed timers.
    ///
    /// Dead nodes surfacing at the top are reclaimed here; entries with a
    /// pending later reschedule are pushed back down.
    pub fn peek_top_time(&mut self) -> Option<Dsec> {
        loop {
            let entry = self.heap.peek()?.0;
            let slot = &mut self.slots[entry.id.index as usize];
            if slot.gen != entry.id.gen {
                self.heap.pop();
                continue;
            }
            match &mut slot.state {
                SlotState::Free => {
                    self.heap.pop();
                }
                SlotState::Dead => {
                    self.heap.pop();
                    self.release(entry.id.index);
                }
                SlotState::Armed { sched, updated, .. } => {
                    if *updated > *sched {
                        *sched = *updated;
                        let time = *updated;
                        self.heap.pop();
                        self.heap.push(Reverse(HeapEntry { time, id: entry.id }));
                    } else {
                        return Some(entry.time);
                    }
                }
            }
        }
    }

    /// Fires the earliest armed timer, returning its deadline and payload.
    pub fn expire_one(&mut self) -> Option<(Dsec, T)> {
        let time = self.peek_top_time()?;
        let entry = self.heap.pop().expect("validated by peek").0;
        let payload = match self.slots[entry.id.index as usize].state {
            SlotState::Armed { payload, .. } => payload,
            _ => unreachable!("peek_top_time leaves an armed node on top"),
        };
        self.release(entry.id.index);
        self.counters.st_handle += 1;
        trace!(time, "timer fired");
        Some((time, payload))
    }

    /// Fires every timer with a deadline strictly below `now`.
    pub fn try_handle_events(&mut self, now: Dsec, mut f: impl FnMut(T)) {
        while let Some(top) = self.peek_top_time() {
            if top >= now {
                break;
            }
            let (_, payload) = self.expire_one().expect("non-empty after peek");
            f(payload);
        }
    }

    /// Unconditionally fires everything still armed. Shutdown path.
    pub fn drain_all(&mut self, mut f: impl FnMut(T)) {
        while let Some((_, payload)) = self.expire_one() {
            f(payload);
        }
        debug_assert_eq!(self.counters.st_alloc, self.counters.st_free);
    }

    /// Number of live (armed) timers.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Armed { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counters(&self) -> &TimerWheelCounters {
        &self.counters
    }

    fn alloc_node(&mut self, time: Dsec, payload: T) -> NodeId {
        self.counters.st_alloc += 1;
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot { gen: 0, state: SlotState::Free });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.state = SlotState::Armed { sched: time, updated: time, payload };
        let id = NodeId { index, gen: slot.gen };
        self.heap.push(Reverse(HeapEntry { time, id }));
        id
    }

    fn release(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.state = SlotState::Free;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(index);
        self.counters.st_free += 1;
    }

    fn live_index(&self, handle: &TimerHandle) -> Option<u32> {
        let id = handle.node?;
        let slot = self.slots.get(id.index as usize)?;
        if slot.gen == id.gen && matches!(slot.state, SlotState::Armed { .. }) {
            Some(id.index)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TestFlow {
        id: u32,
        timer: TimerHandle,
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut tw: TimerWheel<u32> = TimerWheel::new();
        let mut f1 = TestFlow { id: 1, ..Default::default() };
        let mut f2 = TestFlow { id: 2, ..Default::default() };
        let mut f3 = TestFlow { id: 3, ..Default::default() };

        assert_eq!(tw.peek_top_time(), None);
        tw.restart_timer(&mut f1.timer, 10.0, f1.id);
        tw.restart_timer(&mut f2.timer, 5.0, f2.id);
        tw.restart_timer(&mut f3.timer, 1.0, f3.id);

        // peek is idempotent
        assert_eq!(tw.peek_top_time(), Some(1.0));
        assert_eq!(tw.peek_top_time(), Some(1.0));

        assert_eq!(tw.expire_one(), Some((1.0, 3)));
        assert_eq!(tw.peek_top_time(), Some(5.0));
        assert_eq!(tw.expire_one(), Some((5.0, 2)));
        assert_eq!(tw.peek_top_time(), Some(10.0));
        assert_eq!(tw.expire_one(), Some((10.0, 1)));
        assert_eq!(tw.expire_one(), None);
    }

    #[test]
    fn stopped_nodes_reclaimed_lazily() {
        let mut tw: TimerWheel<u32> = TimerWheel::new();
        let mut flows: Vec<TestFlow> = (0..100)
            .map(|id| TestFlow { id, ..Default::default() })
            .collect();

        for f in &mut flows {
            tw.restart_timer(&mut f.timer, 10.1, f.id);
        }
        assert_eq!(tw.counters().st_alloc - tw.counters().st_free, 100);

        tw.try_handle_events(0.1, |_| panic!("nothing due yet"));
        assert_eq!(tw.counters().st_alloc - tw.counters().st_free, 100);

        for f in &mut flows {
            tw.stop_timer(&mut f.timer);
        }
        // stop does not touch the heap
        assert_eq!(tw.counters().st_alloc - tw.counters().st_free, 100);

        tw.try_handle_events(0.1, |_| panic!("stopped timers must not fire"));
        // the dead nodes were reclaimed on the way to the (absent) top
        assert_eq!(tw.counters().st_alloc - tw.counters().st_free, 0);
    }

    #[test]
    fn stop_hides_timer_from_peek() {
        let mut tw: TimerWheel<u32> = TimerWheel::new();
        let mut f1 = TestFlow { id: 1, ..Default::default() };
        let mut f2 = TestFlow { id: 2, ..Default::default() };
        let mut f3 = TestFlow { id: 3, ..Default::default() };

        tw.restart_timer(&mut f1.timer, 10.0, f1.id);
        tw.restart_timer(&mut f2.timer, 5.0, f2.id);
        tw.restart_timer(&mut f3.timer, 1.0, f3.id);
        tw.stop_timer(&mut f1.timer);

        assert_eq!(tw.peek_top_time(), Some(1.0));
        assert_eq!(tw.expire_one(), Some((1.0, 3)));
        assert_eq!(tw.expire_one(), Some((5.0, 2)));
        assert_eq!(tw.peek_top_time(), None);
    }

    #[test]
    fn many_timers_fire_in_order() {
        let mut tw: TimerWheel<u32> = TimerWheel::new();
        let mut flows: Vec<TestFlow> = (0..100)
            .map(|id| TestFlow { id, ..Default::default() })
            .collect();
        for f in &mut flows {
            tw.restart_timer(&mut f.timer, 100.0 - f64::from(f.id), f.id);
        }

        let mut expect_time = 1.0;
        let mut expect_id = 99;
        while let Some(t) = tw.peek_top_time() {
            assert_eq!(t, expect_time);
            let (_, id) = tw.expire_one().unwrap();
            assert_eq!(id, expect_id);
            expect_time += 1.0;
            expect_id = expect_id.wrapping_sub(1);
        }

        let c = *tw.counters();
        assert_eq!(c.st_handle, 100);
        assert_eq!(c.st_alloc, 100);
        assert_eq!(c.st_free, 100);
        assert_eq!(c.st_start, 100);
    }

    #[test]
    fn reschedule_then_stop_never_fires() {
        let mut tw: TimerWheel<u32> = TimerWheel::new();
        let mut flows: Vec<TestFlow> = (0..100)
            .map(|id| TestFlow { id, ..Default::default() })
            .collect();
        for f in &mut flows {
            let id = f.id;
            tw.restart_timer(&mut f.timer, 500.0 - f64::from(id), id);
            // later: cheap in-place update
            tw.restart_timer(&mut f.timer, 1000.0 - f64::from(id), id);
            // earlier: pays one allocation
            tw.restart_timer(&mut f.timer, 100.0 - f64::from(id), id);
            tw.stop_timer(&mut f.timer);
        }

        assert_eq!(tw.peek_top_time(), None);
        let c = *tw.counters();
        assert_eq!(c.st_handle, 0);
        assert_eq!(c.st_start, 300);
        assert_eq!(c.st_alloc, 200); // one per initial arm, one per earlier move
        assert_eq!(c.st_alloc, c.st_free);
    }

    #[test]
    fn later_reschedule_fires_at_new_time() {
        let mut tw: TimerWheel<u32> = TimerWheel::new();
        let mut f = TestFlow { id: 7, ..Default::default() };
        tw.restart_timer(&mut f.timer, 2.0, f.id);
        tw.restart_timer(&mut f.timer, 8.0, f.id);
        assert_eq!(tw.counters().st_alloc, 1);
        assert_eq!(tw.peek_top_time(), Some(8.0));
        assert_eq!(tw.expire_one(), Some((8.0, 7)));
    }

    #[test]
    fn drain_all_fires_remaining() {
        let mut tw: TimerWheel<u32> = TimerWheel::new();
        let mut flows: Vec<TestFlow> = (0..10)
            .map(|id| TestFlow { id, ..Default::default() })
            .collect();
        for f in &mut flows {
            tw.restart_timer(&mut f.timer, 1000.0 + f64::from(f.id), f.id);
        }
        let mut fired = Vec::new();
        tw.drain_all(|id| fired.push(id));
        assert_eq!(fired.len(), 10);
        assert!(tw.is_empty());
    }

    #[test]
    fn handle_stale_after_fire_rearms_cleanly() {
        let mut tw: TimerWheel<u32> = TimerWheel::new();
        let mut f = TestFlow { id: 1, ..Default::default() };
        tw.restart_timer(&mut f.timer, 1.0, f.id);
        assert!(tw.is_armed(&f.timer));
        tw.expire_one().unwrap();
        assert!(!tw.is_armed(&f.timer));

        // stale handle re-arms as if unarmed, one live node again
        tw.restart_timer(&mut f.timer, 2.0, f.id);
        assert!(tw.is_armed(&f.timer));
        assert_eq!(tw.len(), 1);
    }
}
