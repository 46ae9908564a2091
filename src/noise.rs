//! RF noise sources.
//!
//! An interferer with a position, a frequency band and an emitted power,
//! toggled between on and off phases by its own event. A source with a
//! zero off time is permanently active; one with a zero on time never
//! transmits at all.

use crate::events::{Event, EventFn, EventSlot};
use crate::sim::Simulation;

pub struct Noise {
	pub name: String,
	pub uid: usize,
	pub x: f32,
	pub y: f32,
	/// Band limits in Hz.
	pub freq_a: f32,
	pub freq_b: f32,
	/// Emitted power in dBm.
	pub power: f32,
	/// Phase durations in µs.
	pub on: u64,
	pub off: u64,

	pub active: bool,
}

impl Simulation {
	pub(crate) fn noise_start(&mut self, i: usize) {
		let noise = &mut self.noises[i];

		if noise.off == 0 {
			noise.active = true;
		} else if noise.on == 0 {
			warn!("{}: noise source is always off", noise.name);
			noise.active = false;
		} else {
			noise.active = false;
			self.noise_toggle(i);
		}

		let noise = &self.noises[i];
		debug!(
			"{}: started ({:.2}, {:.2}), on = {} us, off = {} us",
			noise.name, noise.x, noise.y, noise.on, noise.off
		);
	}

	pub(crate) fn noise_toggle(&mut self, i: usize) {
		let noise = &mut self.noises[i];

		let timeout = if noise.active {
			noise.active = false;
			debug!("{}: now off for {} us", noise.name, noise.off);
			noise.off
		} else {
			noise.active = true;
			debug!("{}: now on for {} us", noise.name, noise.on);
			noise.on
		};

		self.events.add(
			self.cycle,
			timeout,
			Event {
				slot: EventSlot::Noise(i),
				callback: EventFn::NoiseToggle,
			},
		);
	}
}
