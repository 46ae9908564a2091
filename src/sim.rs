//! The simulation context and driver loop.
//!
//! One value owns everything: the nodes (and with them every transceiver),
//! the noise sources, the sniffers, the event queue and the PRNG. All
//! subsystems receive it explicitly, so tests stay isolated and several
//! simulations can coexist in one process.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::Result;
use crate::events::{Event, EventFn, EventQueue, EventSlot};
use crate::noise::Noise;
use crate::rand::Rand;
use crate::sniffer::Sniffer;
use crate::soc::{Node, RAM_SIZE};

/// Set by the SIGINT handler; the driver loop exits cleanly.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

pub const DEFAULT_SEED: u32 = 123_456;
pub const DEFAULT_TIME: u64 = 1_000_000;

pub struct Simulation {
	pub seed: u32,
	/// End of simulated time in µs.
	pub end_time: u64,
	/// Multiplier applied to configured positions.
	pub scale: f32,
	/// Current simulated time in µs.
	pub cycle: u64,

	pub rand: Rand,
	pub events: EventQueue,
	pub nodes: Vec<Node>,
	pub noises: Vec<Noise>,
	pub sniffers: Vec<Sniffer>,
}

impl Simulation {
	pub fn new() -> Self {
		Self {
			seed: DEFAULT_SEED,
			end_time: DEFAULT_TIME,
			scale: 1.0,
			cycle: 0,
			rand: Rand::new(DEFAULT_SEED),
			events: EventQueue::new(),
			nodes: Vec::new(),
			noises: Vec::new(),
			sniffers: Vec::new(),
		}
	}

	/// Reseeds the PRNG; called once the configuration is fully read.
	pub fn set_seed(&mut self, seed: u32) {
		self.seed = seed;
		self.rand = Rand::new(seed);
	}

	/// Creates a node running the given firmware image and returns its uid.
	pub fn add_node(&mut self, name: &str, x: f32, y: f32, id: u32, image: &[u8]) -> Result<usize> {
		assert!(image.len() <= RAM_SIZE);

		let uid = self.nodes.len();
		let node = Node::new(name.to_string(), x, y, id, uid, image);
		debug!("{}: started ({:.2}, {:.2})", node.name, node.x, node.y);
		self.nodes.push(node);
		Ok(uid)
	}

	/// Declares a noise source; frequencies in Hz, times in µs.
	#[allow(clippy::too_many_arguments)]
	pub fn add_noise(
		&mut self,
		name: &str,
		x: f32,
		y: f32,
		freq_a: f32,
		freq_b: f32,
		power: f32,
		on: u64,
		off: u64,
	) -> usize {
		let uid = self.noises.len();
		self.noises.push(Noise {
			name: name.to_string(),
			uid,
			x,
			y,
			freq_a,
			freq_b,
			power,
			on,
			off,
			active: false,
		});
		self.noise_start(uid);
		uid
	}

	pub fn add_sniffer(&mut self, sniffer: Sniffer) -> usize {
		let uid = self.sniffers.len();
		self.sniffers.push(sniffer);
		uid
	}

	pub(crate) fn dispatch_event(&mut self, event: Event) -> Result<()> {
		match (event.callback, event.slot) {
			(EventFn::CsmaBackoff, EventSlot::TrxTx(n)) => self.trx_backoff_expired(n),
			(EventFn::TxEnd, EventSlot::TrxTx(n)) => self.trx_tx_end(n),
			(EventFn::AckTimeout, EventSlot::TrxTx(n)) => self.trx_ack_wait_timeout(n),
			(EventFn::RxEnd, EventSlot::TrxRx(n)) => self.trx_rx_end(n),
			(EventFn::TxAck, EventSlot::TrxRx(n)) => self.trx_tx_ack(n),
			(EventFn::TimerTick, EventSlot::Timer(n, timer)) => {
				self.sys_timer_tick(n, timer);
				Ok(())
			}
			(EventFn::NoiseToggle, EventSlot::Noise(i)) => {
				self.noise_toggle(i);
				Ok(())
			}
			(callback, slot) => {
				unreachable!("event {callback:?} fired on foreign slot {slot:?}")
			}
		}
	}

	/// The global loop: per cycle, one instruction on every node, then the
	/// expired events in insertion order. When every CPU sleeps the clock
	/// jumps to the next event.
	pub fn run(&mut self) -> Result<()> {
		while self.cycle < self.end_time {
			if SHUTDOWN.load(Ordering::Relaxed) {
				break;
			}

			let mut all_sleeping = !self.nodes.is_empty();

			for n in 0..self.nodes.len() {
				self.node_step(n)?;
				if !self.nodes[n].cpu.sleeping {
					all_sleeping = false;
				}
			}

			while let Some(event) = self.events.pop_due(self.cycle) {
				self.dispatch_event(event)?;
			}

			if all_sleeping && !self.events.is_empty() {
				self.cycle += self.events.jump(self.cycle).max(1);
			} else {
				self.cycle += 1;
			}
		}

		Ok(())
	}
}

impl Default for Simulation {
	fn default() -> Self {
		Self::new()
	}
}
