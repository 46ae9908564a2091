//! The shared RF medium.
//!
//! Couples every transceiver to every other transmitter, noise source and
//! sniffer: free-space path loss plus per-pair extra loss and a random
//! fade, carrier ranking, dB-domain power sums for RSSI, and the LQI
//! estimate that degrades monotonically over a reception. All power
//! arithmetic is f32 with a fixed reduction order so that runs are
//! reproducible across platforms.

use crate::MHZ;
use crate::Result;
use crate::sim::Simulation;

/// m/s
const C: f32 = 299_792_458.0;
/// dBm
const NOISE_FLOOR: f32 = -120.0;
/// dB, applied on top of free-space loss between nodes
const ADD_PATH_LOSS: f32 = 6.0;

#[inline]
fn distance(x1: f32, y1: f32, x2: f32, y2: f32) -> f32 {
	((x1 - x2) * (x1 - x2) + (y1 - y2) * (y1 - y2)).sqrt()
}

/// Sum of two powers given in dB.
#[inline]
fn padd(a: f32, b: f32) -> f32 {
	10.0 * (10.0f32.powf(a / 10.0) + 10.0f32.powf(b / 10.0)).log10()
}

/// Difference of two powers given in dB.
#[inline]
fn psub(a: f32, b: f32) -> f32 {
	10.0 * (10.0f32.powf(a / 10.0) - 10.0f32.powf(b / 10.0)).log10()
}

#[inline]
fn lqi_limit(lqi: f32) -> f32 {
	lqi.clamp(0.0, 1.0)
}

fn free_space_loss(dist: f32, lambda: f32) -> f32 {
	20.0 * (4.0 * core::f32::consts::PI * dist / lambda).log10()
}

impl Simulation {
	/// Recomputes what receiver `n` currently hears: RSSI over all
	/// carriers and in-band noise, the top carrier and its sender, and the
	/// running LQI product for an in-flight reception.
	pub(crate) fn medium_update(&mut self, n: usize) {
		let freq = self.nodes[n].trx.reg.channel as f32 * MHZ;
		let lambda = C / freq;
		let (rx_x, rx_y) = (self.nodes[n].x, self.nodes[n].y);
		let rx_channel = self.nodes[n].trx.reg.channel;
		let rx_sensitivity = self.nodes[n].trx.reg.rx_sensitivity;

		let mut noise = NOISE_FLOOR;
		let mut carriers = [NOISE_FLOOR; 3];
		let mut senders: [Option<usize>; 3] = [None; 3];
		let mut dists = [10_000.0f32; 3];

		for tx in 0..self.nodes.len() {
			let tx_trx = &self.nodes[tx].trx;
			if tx == n || !tx_trx.tx || tx_trx.reg.channel != rx_channel {
				continue;
			}

			let dist = distance(rx_x, rx_y, self.nodes[tx].x, self.nodes[tx].y);
			let loss = free_space_loss(dist, lambda);
			let add_loss = self.nodes[n].trx.loss_trx.get(&tx).copied().unwrap_or(0.0);
			let mut power =
				self.nodes[tx].trx.reg.tx_power - loss - add_loss - ADD_PATH_LOSS;

			// Random power loss due to fading and multipath (-10..0 dB).
			power += -10.0 * self.rand.next_f();

			if power < rx_sensitivity {
				continue;
			}

			if power > carriers[0] {
				senders[2] = senders[1];
				senders[1] = senders[0];
				senders[0] = Some(tx);

				dists[2] = dists[1];
				dists[1] = dists[0];
				dists[0] = dist;

				carriers[2] = carriers[1];
				carriers[1] = carriers[0];
				carriers[0] = power;
			} else if power > carriers[1] {
				senders[2] = senders[1];
				senders[1] = Some(tx);

				dists[2] = dists[1];
				dists[1] = dist;

				carriers[2] = carriers[1];
				carriers[1] = power;
			} else if power > carriers[2] {
				senders[2] = Some(tx);
				dists[2] = dist;
				carriers[2] = power;
			}

			noise = padd(noise, power);
		}

		for i in 0..self.noises.len() {
			let src = &self.noises[i];
			if !src.active || freq < src.freq_a || freq > src.freq_b {
				continue;
			}

			let dist = distance(rx_x, rx_y, src.x, src.y);
			let loss = free_space_loss(dist, lambda);
			let add_loss = self.nodes[n].trx.loss_noise.get(&i).copied().unwrap_or(0.0);
			let power = self.noises[i].power - loss - add_loss;
			noise = padd(noise, power);
		}

		let trx = &mut self.nodes[n].trx;
		trx.rx_rssi = noise;
		trx.rx_carrier = carriers[0];
		trx.rx_dist = dists[0];

		// A change of the dominant transmitter mid-reception corrupts the
		// frame in flight.
		if trx.rx_trx != senders[0] {
			trx.rx_crc_ok = false;
		}

		if !trx.rx_trx_lock {
			trx.rx_trx = senders[0];
		}

		if senders[0].is_none() {
			return;
		}

		// LQI drop due to correlated noise (the runner-up carrier).
		let lqi_carrier = if senders[1].is_some() {
			lqi_limit((carriers[0] - carriers[1]) / 3.0)
		} else {
			1.0
		};

		// LQI drop due to uncorrelated noise.
		let residual = psub(noise, carriers[0]);
		let lqi_noise = lqi_limit((carriers[0] - residual) / 3.0);

		// LQI drop due to the absolute receive power level.
		let lqi_power = lqi_limit(1.0 - (-0.2 * (carriers[0] - NOISE_FLOOR)).exp());

		trx.rx_lqi *= lqi_carrier * lqi_noise * lqi_power;
	}

	/// A transmitter keyed up: every listening transceiver re-evaluates
	/// the medium, and those now locked onto this sender with a matching
	/// SFD begin reception.
	pub(crate) fn medium_tx_start(&mut self, tx: usize) -> Result<()> {
		for rx in 0..self.nodes.len() {
			if self.nodes[rx].trx.rx {
				self.medium_update(rx);
			}

			let rx_trx = &self.nodes[rx].trx;
			if rx_trx.rx
				&& rx_trx.rx_trx == Some(tx)
				&& rx_trx.reg.sfd == self.nodes[tx].trx.reg.sfd
			{
				self.trx_rx_start(rx)?;
			}
		}
		Ok(())
	}

	/// A transmitter stopped, normally or aborted. Receivers still latched
	/// onto it are notified; on a normal end the frame also reaches every
	/// sniffer in range.
	pub(crate) fn medium_tx_end(&mut self, tx: usize, normal: bool) -> Result<()> {
		for rx in 0..self.nodes.len() {
			let rx_trx = &self.nodes[rx].trx;
			if rx_trx.rx && rx_trx.rx_trx == Some(tx) && rx_trx.rx_trx_lock && !normal {
				self.trx_rx_interrupted(rx);
			}
		}

		if !normal {
			return Ok(());
		}

		let freq = self.nodes[tx].trx.reg.channel as f32 * MHZ;
		let lambda = C / freq;
		let (tx_x, tx_y) = (self.nodes[tx].x, self.nodes[tx].y);
		let tx_power = self.nodes[tx].trx.reg.tx_power;
		let data = self.nodes[tx].trx.tx_data;
		let cycle = self.cycle;

		for s in 0..self.sniffers.len() {
			let sniffer = &self.sniffers[s];
			if freq < sniffer.freq_a || freq > sniffer.freq_b {
				continue;
			}

			let dist = distance(sniffer.x, sniffer.y, tx_x, tx_y);
			let loss = free_space_loss(dist, lambda);
			let add_loss = sniffer.loss_trx.get(&tx).copied().unwrap_or(0.0);
			let power = tx_power - loss - add_loss;

			if power < sniffer.sensitivity {
				continue;
			}

			self.sniffers[s].write_frame(cycle, &data, power)?;
		}
		Ok(())
	}
}
