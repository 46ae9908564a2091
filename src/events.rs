//! The discrete event queue.
//!
//! A time-ordered list of scheduled callbacks keyed by absolute cycle.
//! Every schedulable activity in the simulator owns a fixed *slot* (a
//! transceiver's TX chain, its RX chain, one per system timer, one per
//! noise source); a slot is queued at most once at any time. Entries with
//! equal cycles fire in insertion order, and entries inserted while the
//! queue is draining land behind everything already due.

/// Identifies the owner of a scheduled event. At most one entry per slot
/// may be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSlot {
	/// The transmit chain of the transceiver on node `uid`.
	TrxTx(usize),
	/// The receive chain of the transceiver on node `uid`.
	TrxRx(usize),
	/// System timer `timer` on node `uid`.
	Timer(usize, usize),
	/// Noise source `uid`.
	Noise(usize),
}

/// What to do when the entry fires. Dispatched by the simulation driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFn {
	/// CSMA/CA backoff period expired; run CCA.
	CsmaBackoff,
	/// Air time of an outgoing frame elapsed.
	TxEnd,
	/// No ACK arrived within the ACK wait duration.
	AckTimeout,
	/// An incoming frame is fully received (fires 1 µs before air end).
	RxEnd,
	/// RX-to-TX turnaround elapsed; transmit the pending ACK.
	TxAck,
	/// Periodic timer tick.
	TimerTick,
	/// Toggle a noise source between its on and off phases.
	NoiseToggle,
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
	pub slot: EventSlot,
	pub callback: EventFn,
}

#[derive(Debug)]
struct Entry {
	time: u64,
	seq: u64,
	event: Event,
}

#[derive(Debug, Default)]
pub struct EventQueue {
	// Sorted by (time, seq); seq is globally monotonic, so equal-time
	// entries are already in insertion order and a plain partition point
	// is a stable insert.
	entries: Vec<Entry>,
	next_seq: u64,
}

impl EventQueue {
	pub fn new() -> Self {
		Self::default()
	}

	/// Schedules `event` at `now + timeout`. The caller must ensure the
	/// slot is free; scheduling an already-queued slot is a logic error
	/// reported by the owner with full context.
	pub fn add(&mut self, now: u64, timeout: u64, event: Event) {
		debug_assert!(!self.is_planned(event.slot));

		let time = now + timeout;
		let seq = self.next_seq;
		self.next_seq += 1;

		let at = self.entries.partition_point(|e| e.time <= time);
		self.entries.insert(at, Entry { time, seq, event });
	}

	/// Unlinks the entry owned by `slot`. Idempotent.
	pub fn remove(&mut self, slot: EventSlot) {
		self.entries.retain(|e| e.event.slot != slot);
	}

	pub fn is_planned(&self, slot: EventSlot) -> bool {
		self.entries.iter().any(|e| e.event.slot == slot)
	}

	/// Pops the next entry due exactly at `now`, if any. The driver calls
	/// this in a loop so that callbacks may add and remove entries while
	/// the queue drains.
	pub fn pop_due(&mut self, now: u64) -> Option<Event> {
		if self.entries.first()?.time == now {
			Some(self.entries.remove(0).event)
		} else {
			None
		}
	}

	/// Cycles until the next entry, or 0 if the queue is empty. Used to
	/// fast-forward the clock when every CPU sleeps.
	pub fn jump(&self, now: u64) -> u64 {
		self.entries.first().map_or(0, |e| e.time - now)
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ev(uid: usize) -> Event {
		Event {
			slot: EventSlot::Noise(uid),
			callback: EventFn::NoiseToggle,
		}
	}

	#[test]
	fn fires_in_time_order() {
		let mut q = EventQueue::new();
		q.add(0, 30, ev(0));
		q.add(0, 10, ev(1));
		q.add(0, 20, ev(2));

		assert_eq!(q.pop_due(10).unwrap().slot, EventSlot::Noise(1));
		assert!(q.pop_due(10).is_none());
		assert_eq!(q.pop_due(20).unwrap().slot, EventSlot::Noise(2));
		assert_eq!(q.pop_due(30).unwrap().slot, EventSlot::Noise(0));
		assert!(q.is_empty());
	}

	#[test]
	fn equal_times_fire_in_insertion_order() {
		let mut q = EventQueue::new();
		for uid in 0..8 {
			q.add(0, 5, ev(uid));
		}
		for uid in 0..8 {
			assert_eq!(q.pop_due(5).unwrap().slot, EventSlot::Noise(uid));
		}
	}

	#[test]
	fn insert_while_draining_lands_behind() {
		let mut q = EventQueue::new();
		q.add(0, 5, ev(0));
		q.add(0, 5, ev(1));

		assert_eq!(q.pop_due(5).unwrap().slot, EventSlot::Noise(0));
		// A callback re-arming at the same cycle must fire after the
		// remaining due entries.
		q.add(5, 0, ev(2));
		assert_eq!(q.pop_due(5).unwrap().slot, EventSlot::Noise(1));
		assert_eq!(q.pop_due(5).unwrap().slot, EventSlot::Noise(2));
	}

	#[test]
	fn remove_is_idempotent() {
		let mut q = EventQueue::new();
		q.add(0, 10, ev(0));
		assert!(q.is_planned(EventSlot::Noise(0)));

		q.remove(EventSlot::Noise(0));
		assert!(!q.is_planned(EventSlot::Noise(0)));
		q.remove(EventSlot::Noise(0));
		assert!(q.is_empty());
	}

	#[test]
	fn jump_reports_distance_to_head() {
		let mut q = EventQueue::new();
		assert_eq!(q.jump(0), 0);

		q.add(0, 40, ev(0));
		q.add(0, 90, ev(1));
		assert_eq!(q.jump(0), 40);
		assert_eq!(q.jump(15), 25);
	}

	#[test]
	fn is_planned_tracks_membership() {
		let mut q = EventQueue::new();
		q.add(0, 3, ev(7));
		assert!(q.is_planned(EventSlot::Noise(7)));
		assert!(!q.is_planned(EventSlot::Noise(8)));
		assert!(q.pop_due(3).is_some());
		assert!(!q.is_planned(EventSlot::Noise(7)));
	}
}
