//! SYS_TIMER: a periodic event source raising one IRQ line per timer.
//!
//! Writing PERIOD reschedules the timer's event; the callback increments
//! COUNTER, latches the COUNT interrupt flag, raises the IRQ line when the
//! masked flags are nonzero and re-arms itself. INTFLAG is write-1-to-clear
//! and lowers the line when the masked flags reach zero. Word access only.

use crate::events::{Event, EventFn, EventSlot};
use crate::sim::Simulation;
use crate::soc::SOC_IRQ_SYS_TIMER_0;

pub const SYS_TIMER_CONTROL: u32 = 0x00;
/// Tick period in µs; 0 stops the timer.
pub const SYS_TIMER_PERIOD: u32 = 0x04;
/// Number of expired periods; writable.
pub const SYS_TIMER_COUNTER: u32 = 0x08;
/// Read: interrupt mask. Write: clear the given mask bits.
pub const SYS_TIMER_INTENCLR: u32 = 0x0c;
/// Read: interrupt mask. Write: set the given mask bits.
pub const SYS_TIMER_INTENSET: u32 = 0x10;
/// The interrupt mask itself.
pub const SYS_TIMER_INTMASK: u32 = 0x14;
/// Latched interrupt flags, write-1-to-clear.
pub const SYS_TIMER_INTFLAG: u32 = 0x18;

/// INTFLAG bit set on every period expiry.
pub const SYS_TIMER_INTFLAG_COUNT: u32 = 1 << 0;

#[derive(Debug, Default)]
pub struct SysTimer {
	pub control: u32,
	pub period: u32,
	pub counter: u32,
	pub intmask: u32,
	pub intflag: u32,
}

impl SysTimer {
	pub fn new() -> Self {
		Self::default()
	}

	pub(crate) fn read_w(&self, addr: u32) -> u32 {
		match addr {
			SYS_TIMER_CONTROL => self.control,
			SYS_TIMER_PERIOD => self.period,
			SYS_TIMER_COUNTER => self.counter,
			SYS_TIMER_INTENCLR | SYS_TIMER_INTENSET | SYS_TIMER_INTMASK => self.intmask,
			SYS_TIMER_INTFLAG => self.intflag,
			_ => 0,
		}
	}
}

impl Simulation {
	pub(crate) fn sys_timer_write_w(&mut self, n: usize, timer: usize, addr: u32, data: u32) {
		let irq = SOC_IRQ_SYS_TIMER_0 + timer as u32;
		let slot = EventSlot::Timer(n, timer);

		match addr {
			SYS_TIMER_CONTROL => {}
			SYS_TIMER_PERIOD => {
				self.nodes[n].timers[timer].period = data;

				if self.events.is_planned(slot) {
					self.events.remove(slot);
				}

				if data != 0 {
					self.events.add(
						self.cycle,
						data.into(),
						Event {
							slot,
							callback: EventFn::TimerTick,
						},
					);
				}
			}
			SYS_TIMER_COUNTER => self.nodes[n].timers[timer].counter = data,
			SYS_TIMER_INTENCLR => self.nodes[n].timers[timer].intmask &= !data,
			SYS_TIMER_INTENSET => self.nodes[n].timers[timer].intmask |= data,
			SYS_TIMER_INTMASK => self.nodes[n].timers[timer].intmask = data,
			SYS_TIMER_INTFLAG => {
				let t = &mut self.nodes[n].timers[timer];
				t.intflag &= !data;

				if t.intflag & t.intmask == 0 {
					self.nodes[n].cpu.irq_clear(irq);
				}
			}
			_ => {}
		}
	}

	/// Period expiry: bump the counter, latch the flag, raise the line if
	/// unmasked and re-arm.
	pub(crate) fn sys_timer_tick(&mut self, n: usize, timer: usize) {
		let irq = SOC_IRQ_SYS_TIMER_0 + timer as u32;

		let t = &mut self.nodes[n].timers[timer];
		t.counter = t.counter.wrapping_add(1);
		t.intflag |= SYS_TIMER_INTFLAG_COUNT;
		let fire = t.intflag & t.intmask != 0;
		let period = t.period;

		if fire {
			self.nodes[n].cpu.irq_set(irq);
		}

		self.events.add(
			self.cycle,
			period.into(),
			Event {
				slot: EventSlot::Timer(n, timer),
				callback: EventFn::TimerTick,
			},
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sim::Simulation;

	const TIMER0: u32 = 0x0200_0000;

	fn sim_with_node() -> Simulation {
		let mut sim = Simulation::new();
		sim.add_node("t", 0.0, 0.0, 0, &[]).unwrap();
		sim
	}

	/// Runs the event loop only, leaving the CPU alone.
	fn tick_events(sim: &mut Simulation, cycles: u64) {
		for _ in 0..cycles {
			while let Some(event) = sim.events.pop_due(sim.cycle) {
				sim.dispatch_event(event).unwrap();
			}
			sim.cycle += 1;
		}
	}

	#[test]
	fn counts_once_per_period() {
		let mut sim = sim_with_node();
		sim.write_w(0, TIMER0 + SYS_TIMER_PERIOD, 5_000).unwrap();

		// Drive through cycle 100,000 inclusive: 20 full periods.
		tick_events(&mut sim, 100_001);
		assert_eq!(sim.read_w(0, TIMER0 + SYS_TIMER_COUNTER).unwrap(), 20);
	}

	#[test]
	fn raises_irq_only_when_masked_in() {
		let mut sim = sim_with_node();
		sim.write_w(0, TIMER0 + SYS_TIMER_PERIOD, 10).unwrap();

		tick_events(&mut sim, 11);
		assert_eq!(sim.nodes[0].cpu.irqs, 0, "masked-out flag must not raise");
		assert_eq!(
			sim.read_w(0, TIMER0 + SYS_TIMER_INTFLAG).unwrap(),
			SYS_TIMER_INTFLAG_COUNT
		);

		sim.write_w(0, TIMER0 + SYS_TIMER_INTENSET, SYS_TIMER_INTFLAG_COUNT)
			.unwrap();
		tick_events(&mut sim, 10);
		assert_eq!(sim.nodes[0].cpu.irqs, 1 << SOC_IRQ_SYS_TIMER_0);

		// Clearing the flag lowers the line.
		sim.write_w(0, TIMER0 + SYS_TIMER_INTFLAG, SYS_TIMER_INTFLAG_COUNT)
			.unwrap();
		assert_eq!(sim.nodes[0].cpu.irqs, 0);
	}

	#[test]
	fn rewriting_period_reschedules() {
		let mut sim = sim_with_node();
		sim.write_w(0, TIMER0 + SYS_TIMER_PERIOD, 1_000).unwrap();
		tick_events(&mut sim, 500);

		// Restarting the period mid-flight starts a fresh interval.
		sim.write_w(0, TIMER0 + SYS_TIMER_PERIOD, 1_000).unwrap();
		tick_events(&mut sim, 600);
		assert_eq!(sim.read_w(0, TIMER0 + SYS_TIMER_COUNTER).unwrap(), 0);

		tick_events(&mut sim, 500);
		assert_eq!(sim.read_w(0, TIMER0 + SYS_TIMER_COUNTER).unwrap(), 1);
	}

	#[test]
	fn zero_period_stops_the_timer() {
		let mut sim = sim_with_node();
		sim.write_w(0, TIMER0 + SYS_TIMER_PERIOD, 100).unwrap();
		sim.write_w(0, TIMER0 + SYS_TIMER_PERIOD, 0).unwrap();

		tick_events(&mut sim, 1_000);
		assert_eq!(sim.read_w(0, TIMER0 + SYS_TIMER_COUNTER).unwrap(), 0);
		assert!(sim.events.is_empty());
	}

	#[test]
	fn four_timers_are_independent() {
		let mut sim = sim_with_node();
		sim.write_w(0, 0x0200_0000 + SYS_TIMER_PERIOD, 10).unwrap();
		sim.write_w(0, 0x0500_0000 + SYS_TIMER_PERIOD, 20).unwrap();

		tick_events(&mut sim, 21);
		assert_eq!(sim.read_w(0, 0x0200_0000 + SYS_TIMER_COUNTER).unwrap(), 2);
		assert_eq!(sim.read_w(0, 0x0500_0000 + SYS_TIMER_COUNTER).unwrap(), 1);
	}
}
