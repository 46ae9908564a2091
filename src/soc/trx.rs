//! The radio transceiver.
//!
//! A register-file view of an 802.15.4-style PHY/MAC: firmware drives the
//! STATE register, the transceiver runs CSMA/CA, transmission and reception
//! timing against the event queue, and the medium decides who hears what.
//! Word accesses hit the register file; byte accesses hit the 128-byte
//! frame buffer.

use hashbrown::HashMap;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::Result;
use crate::error::Error;
use crate::events::{Event, EventFn, EventSlot};
use crate::sim::Simulation;
use crate::soc::SOC_IRQ_TRX;

pub const TRX_CONFIG_REG: u32 = 0x00;
pub const TRX_PAN_ID_REG: u32 = 0x04;
pub const TRX_SHORT_ADDR_REG: u32 = 0x08;
pub const TRX_IEEE_ADDR_0_REG: u32 = 0x0c;
pub const TRX_IEEE_ADDR_1_REG: u32 = 0x10;
/// Transmit power in dBm (f32 bit pattern).
pub const TRX_TX_POWER_REG: u32 = 0x14;
/// Receive sensitivity in dBm (f32 bit pattern).
pub const TRX_RX_SENSITIVITY_REG: u32 = 0x18;
/// Channel center frequency in MHz.
pub const TRX_CHANNEL_REG: u32 = 0x1c;
pub const TRX_SFD_VALUE_REG: u32 = 0x20;
pub const TRX_STATE_REG: u32 = 0x24;
pub const TRX_STATUS_REG: u32 = 0x28;
pub const TRX_IRQ_MASK_REG: u32 = 0x2c;
/// Write-1-to-clear.
pub const TRX_IRQ_STATUS_REG: u32 = 0x30;
pub const TRX_FRAME_RETRIES_REG: u32 = 0x34;
pub const TRX_CSMA_RETRIES_REG: u32 = 0x38;
pub const TRX_CSMA_MIN_BE_REG: u32 = 0x3c;
pub const TRX_CSMA_MAX_BE_REG: u32 = 0x40;
pub const TRX_CCA_MODE_REG: u32 = 0x44;
/// Energy-detection threshold in dBm (f32 bit pattern).
pub const TRX_ED_THRESHOLD_REG: u32 = 0x48;
pub const TRX_RSSI_LEVEL_REG: u32 = 0x4c;
/// LQI of the last received frame, scaled to 0..255.
pub const TRX_FRAME_LQI_REG: u32 = 0x50;
/// RSSI of the last received frame in dBm (f32 bit pattern).
pub const TRX_FRAME_RSSI_REG: u32 = 0x54;
/// Start of the frame buffer (byte access).
pub const TRX_FRAME_START_REG: u32 = 0x1000;

const TRX_REG_MASK: u32 = 0x7f;

const SYMBOLS_PER_OCTET: u64 = 2;
/// µs
const SYMBOL_DURATION: u64 = 16;
/// symbols
const UNIT_BACKOFF_PERIOD: u64 = 20;
/// symbols
const TURNAROUND_TIME: u64 = 12;
/// symbols
const PHY_SHR_DURATION: u64 = 10;
/// symbols
const PHY_PHR_DURATION: u64 = 2;

const ACK_WAIT_DURATION: u64 = (UNIT_BACKOFF_PERIOD
	+ TURNAROUND_TIME
	+ PHY_SHR_DURATION
	+ 6 * SYMBOLS_PER_OCTET)
	* SYMBOL_DURATION;

const PHY_PHR_OFFSET: usize = 0;
const PHY_MAX_PSDU_SIZE: u8 = 127;
const PHY_CRC_SIZE: u8 = 2;
const MAC_ACK_SIZE: u8 = 5;
const MAC_SEQ_OFFSET: usize = 3;
const MAC_BROADCAST_PANID: u16 = 0xffff;
const MAC_BROADCAST_ADDR: u16 = 0xffff;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct TrxConfig: u32 {
		const TX_AUTO_CRC      = 1 << 0;
		const RX_AUTO_CRC      = 1 << 1;
		const TX_EXTENDED      = 1 << 2;
		const RX_EXTENDED      = 1 << 3;
		const AACK_COORD       = 1 << 4;
		const AACK_DISABLE_ACK = 1 << 5;
		const AACK_PENDING     = 1 << 6;
		const AACK_FRAME_VER_0 = 1 << 7;
		const AACK_FRAME_VER_1 = 1 << 8;
		const AACK_FRAME_VER_2 = 1 << 9;
		const AACK_FRAME_VER_3 = 1 << 10;
		const AACK_PROM_MODE   = 1 << 11;
		const AACK_ACK_TIME    = 1 << 12;
		const AACK_RECV_RES    = 1 << 13;
		const AACK_FLT_RES     = 1 << 14;
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum TrxState {
	Idle = 0,
	Sleep = 1,
	Tx = 2,
	TxWaitBackoff = 3,
	TxWaitEnd = 4,
	TxWaitEndAack = 5,
	TxWaitAck = 6,
	TxDone = 7,
	Rx = 8,
	RxWaitEnd = 9,
	RxWaitEndAack = 10,
	RxWaitAckTimeout = 11,
	RxDone = 12,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u32)]
pub enum TrxStatus {
	Invalid = 0,
	Success = 1,
	SuccessDataPending = 2,
	ChannelAccessFailure = 3,
	NoAck = 4,
	CrcOk = 5,
	CrcFail = 6,
}

/// IRQ_STATUS / IRQ_MASK bits.
pub const TRX_IRQ_RX_START: u32 = 1 << 0;
pub const TRX_IRQ_RX_END: u32 = 1 << 1;
pub const TRX_IRQ_TX_END: u32 = 1 << 2;

/// The register file, one field per word offset.
#[derive(Debug)]
pub struct TrxRegs {
	pub config: TrxConfig,
	pub pan_id: u32,
	pub short_addr: u32,
	pub ieee_addr_0: u32,
	pub ieee_addr_1: u32,
	pub tx_power: f32,
	pub rx_sensitivity: f32,
	pub channel: u32,
	pub sfd: u32,
	pub state: TrxState,
	pub status: TrxStatus,
	pub irq_mask: u32,
	pub irq_status: u32,
	pub frame_retries: u32,
	pub csma_retries: u32,
	pub csma_min_be: u32,
	pub csma_max_be: u32,
	pub cca_mode: u32,
	pub ed_threshold: f32,
	pub rssi_level: f32,
	pub frame_lqi: u32,
	pub frame_rssi: f32,
}

pub struct Trx {
	pub uid: usize,

	/// Extra path loss towards peer transceivers, keyed by peer uid.
	/// Allocated lazily by the `loss` configuration command.
	pub loss_trx: HashMap<usize, f32, ahash::RandomState>,
	/// Extra path loss towards noise sources, keyed by noise uid.
	pub loss_noise: HashMap<usize, f32, ahash::RandomState>,

	/// An own transmission is in the air.
	pub tx: bool,
	pub tx_csma_be: u32,
	pub tx_csma_ret: u32,
	pub tx_frame_ret: u32,
	/// Latched copy of the frame buffer for the duration of a transmission.
	pub tx_data: [u8; 128],

	/// Listening (RX, RX_WAIT_END or the AACK equivalents).
	pub rx: bool,
	/// The peer currently received from; an index into the node list.
	pub rx_trx: Option<usize>,
	/// Keep `rx_trx` latched until our own end-of-reception fires.
	pub rx_trx_lock: bool,
	pub rx_lqi: f32,
	pub rx_rssi: f32,
	pub rx_carrier: f32,
	pub rx_dist: f32,
	pub rx_crc_ok: bool,

	pub reg: TrxRegs,
	pub buf: [u8; 128],
}

impl Trx {
	pub fn new(uid: usize) -> Self {
		Self {
			uid,
			loss_trx: HashMap::default(),
			loss_noise: HashMap::default(),
			tx: false,
			tx_csma_be: 0,
			tx_csma_ret: 0,
			tx_frame_ret: 0,
			tx_data: [0; 128],
			rx: false,
			rx_trx: None,
			rx_trx_lock: false,
			rx_lqi: 1.0,
			rx_rssi: 0.0,
			rx_carrier: 0.0,
			rx_dist: 0.0,
			rx_crc_ok: false,
			reg: TrxRegs {
				config: TrxConfig::TX_AUTO_CRC
					| TrxConfig::RX_AUTO_CRC
					| TrxConfig::TX_EXTENDED
					| TrxConfig::RX_EXTENDED
					| TrxConfig::AACK_FRAME_VER_0
					| TrxConfig::AACK_FRAME_VER_1,
				pan_id: 0,
				short_addr: 0,
				ieee_addr_0: 0,
				ieee_addr_1: 0,
				tx_power: 3.0,
				rx_sensitivity: -96.0,
				channel: 2425,
				sfd: 0xa7,
				state: TrxState::Idle,
				status: TrxStatus::Invalid,
				irq_mask: 0,
				irq_status: 0,
				frame_retries: 3,
				csma_retries: 4,
				csma_min_be: 3,
				csma_max_be: 5,
				cca_mode: 0,
				ed_threshold: -86.0,
				rssi_level: 0.0,
				frame_lqi: 0,
				frame_rssi: 0.0,
			},
			buf: [0; 128],
		}
	}

	pub(crate) fn config(&self, bit: TrxConfig) -> bool {
		self.reg.config.contains(bit)
	}

	pub(crate) fn read_b(&self, addr: u32) -> u8 {
		self.buf[(addr & TRX_REG_MASK) as usize]
	}

	pub(crate) fn write_b(&mut self, addr: u32, data: u8) {
		self.buf[(addr & TRX_REG_MASK) as usize] = data;
	}

	pub(crate) fn read_w(&self, addr: u32) -> u32 {
		match addr & TRX_REG_MASK {
			TRX_CONFIG_REG => self.reg.config.bits(),
			TRX_PAN_ID_REG => self.reg.pan_id,
			TRX_SHORT_ADDR_REG => self.reg.short_addr,
			TRX_IEEE_ADDR_0_REG => self.reg.ieee_addr_0,
			TRX_IEEE_ADDR_1_REG => self.reg.ieee_addr_1,
			TRX_TX_POWER_REG => self.reg.tx_power.to_bits(),
			TRX_RX_SENSITIVITY_REG => self.reg.rx_sensitivity.to_bits(),
			TRX_CHANNEL_REG => self.reg.channel,
			TRX_SFD_VALUE_REG => self.reg.sfd,
			TRX_STATE_REG => self.reg.state.into(),
			TRX_STATUS_REG => self.reg.status.into(),
			TRX_IRQ_MASK_REG => self.reg.irq_mask,
			TRX_IRQ_STATUS_REG => self.reg.irq_status,
			TRX_FRAME_RETRIES_REG => self.reg.frame_retries,
			TRX_CSMA_RETRIES_REG => self.reg.csma_retries,
			TRX_CSMA_MIN_BE_REG => self.reg.csma_min_be,
			TRX_CSMA_MAX_BE_REG => self.reg.csma_max_be,
			TRX_CCA_MODE_REG => self.reg.cca_mode,
			TRX_ED_THRESHOLD_REG => self.reg.ed_threshold.to_bits(),
			TRX_RSSI_LEVEL_REG => self.reg.rssi_level.to_bits(),
			TRX_FRAME_LQI_REG => self.reg.frame_lqi,
			TRX_FRAME_RSSI_REG => self.reg.frame_rssi.to_bits(),
			_ => 0,
		}
	}
}

impl Simulation {
	pub(crate) fn trx_write_w(&mut self, n: usize, addr: u32, data: u32) -> Result<()> {
		match addr & TRX_REG_MASK {
			TRX_STATE_REG => return self.trx_set_state(n, data),
			TRX_IRQ_STATUS_REG => {
				let trx = &mut self.nodes[n].trx;
				trx.reg.irq_status &= !data;
				if trx.reg.irq_status == 0 {
					self.nodes[n].cpu.irq_clear(SOC_IRQ_TRX);
				}
			}
			reg => {
				let trx = &mut self.nodes[n].trx;
				match reg {
					TRX_CONFIG_REG => trx.reg.config = TrxConfig::from_bits_retain(data),
					TRX_PAN_ID_REG => trx.reg.pan_id = data,
					TRX_SHORT_ADDR_REG => trx.reg.short_addr = data,
					TRX_IEEE_ADDR_0_REG => trx.reg.ieee_addr_0 = data,
					TRX_IEEE_ADDR_1_REG => trx.reg.ieee_addr_1 = data,
					TRX_TX_POWER_REG => trx.reg.tx_power = f32::from_bits(data),
					TRX_RX_SENSITIVITY_REG => trx.reg.rx_sensitivity = f32::from_bits(data),
					TRX_CHANNEL_REG => trx.reg.channel = data,
					TRX_SFD_VALUE_REG => trx.reg.sfd = data,
					TRX_IRQ_MASK_REG => trx.reg.irq_mask = data,
					TRX_FRAME_RETRIES_REG => trx.reg.frame_retries = data,
					TRX_CSMA_RETRIES_REG => trx.reg.csma_retries = data,
					TRX_CSMA_MIN_BE_REG => trx.reg.csma_min_be = data,
					TRX_CSMA_MAX_BE_REG => trx.reg.csma_max_be = data,
					TRX_CCA_MODE_REG => trx.reg.cca_mode = data,
					TRX_ED_THRESHOLD_REG => trx.reg.ed_threshold = f32::from_bits(data),
					TRX_RSSI_LEVEL_REG => trx.reg.rssi_level = f32::from_bits(data),
					TRX_FRAME_LQI_REG => trx.reg.frame_lqi = data,
					TRX_FRAME_RSSI_REG => trx.reg.frame_rssi = f32::from_bits(data),
					_ => {}
				}
			}
		}
		Ok(())
	}

	/// A firmware write to the STATE register.
	pub(crate) fn trx_set_state(&mut self, n: usize, state: u32) -> Result<()> {
		let current = self.nodes[n].trx.reg.state;

		if state == u32::from(current) {
			return Ok(());
		}

		if state == u32::from(TrxState::Idle) {
			return self.trx_return_to_idle(n);
		}

		match (current, TrxState::try_from(state)) {
			(TrxState::Idle, Ok(TrxState::Tx)) => {
				self.nodes[n].trx.reg.state = TrxState::Tx;
				return self.trx_send(n);
			}
			(TrxState::Idle, Ok(TrxState::Rx)) | (TrxState::RxDone, Ok(TrxState::Rx)) => {
				self.nodes[n].trx.reg.state = TrxState::Rx;
				self.trx_receive(n);
				return Ok(());
			}
			_ => {}
		}

		Err(Error::InvalidStateTransition {
			node: self.nodes[n].name.clone(),
			from: current.into(),
			to: state,
		})
	}

	/// Force-idle: cancel everything in flight, notify the medium if we
	/// were transmitting, release the receive latch.
	fn trx_return_to_idle(&mut self, n: usize) -> Result<()> {
		if self.nodes[n].trx.tx {
			debug!("{}: TX interrupted", self.nodes[n].name);
			self.nodes[n].trx.tx = false;
			self.medium_tx_end(n, false)?;
		}

		let node = &mut self.nodes[n];
		if node.trx.rx {
			if node.trx.reg.state != TrxState::Rx {
				debug!("{}: RX interrupted", node.name);
			}

			node.trx.rx = false;
			node.trx.rx_trx = None;
			node.trx.rx_trx_lock = false;
		}

		self.events.remove(EventSlot::TrxRx(n));
		self.events.remove(EventSlot::TrxTx(n));
		self.nodes[n].trx.reg.state = TrxState::Idle;
		Ok(())
	}

	fn trx_send(&mut self, n: usize) -> Result<()> {
		let node = &mut self.nodes[n];
		debug!("{}: TX", node.name);

		let size = node.trx.buf[PHY_PHR_OFFSET];
		if size < PHY_CRC_SIZE || size > PHY_MAX_PSDU_SIZE {
			return Err(Error::InvalidFrameSize {
				node: node.name.clone(),
				size,
			});
		}

		node.trx.tx_data = node.trx.buf;

		if node.trx.config(TrxConfig::TX_AUTO_CRC) {
			insert_crc(&mut node.trx.tx_data);
		}

		if node.trx.config(TrxConfig::TX_EXTENDED) {
			node.trx.tx_csma_be = node.trx.reg.csma_min_be;
			node.trx.tx_csma_ret = 0;
			node.trx.tx_frame_ret = 0;
			self.trx_csma_backoff(n)
		} else {
			node.trx.reg.state = TrxState::TxWaitEnd;
			self.trx_transmit_frame(n)
		}
	}

	fn trx_receive(&mut self, n: usize) {
		let node = &mut self.nodes[n];
		debug!(
			"{}: RX {}",
			node.name,
			if node.trx.reg.state == TrxState::TxWaitAck {
				"(AACK)"
			} else {
				""
			}
		);
		node.trx.rx = true;
	}

	fn trx_csma_backoff(&mut self, n: usize) -> Result<()> {
		self.nodes[n].trx.reg.state = TrxState::TxWaitBackoff;

		let be = self.nodes[n].trx.tx_csma_be;
		let draw = u64::from(self.rand.next() & ((1 << be) - 1));
		let delay = draw * UNIT_BACKOFF_PERIOD * SYMBOL_DURATION + 1;

		debug!("{}: ... backoff delay {} us", self.nodes[n].name, delay);

		self.trx_add_tx_event(n, delay, EventFn::CsmaBackoff)
	}

	/// Backoff expired: clear-channel assessment against a fresh medium
	/// estimate, then either transmit or back off again.
	pub(crate) fn trx_backoff_expired(&mut self, n: usize) -> Result<()> {
		if self.nodes[n].trx.reg.state != TrxState::TxWaitBackoff {
			return Err(self.invalid_trx_state(n, "backoff expiry"));
		}

		self.medium_update(n);

		if self.trx_cca_ok(n)? {
			debug!("{}: ... CCA pass", self.nodes[n].name);

			self.nodes[n].trx.reg.state = TrxState::TxWaitEnd;
			self.trx_transmit_frame(n)
		} else {
			debug!("{}: ... CCA fail", self.nodes[n].name);

			let trx = &mut self.nodes[n].trx;
			trx.tx_csma_ret += 1;
			trx.tx_csma_be = (trx.tx_csma_be + 1).min(trx.reg.csma_max_be);

			if trx.tx_csma_ret > trx.reg.csma_retries {
				trx.reg.state = TrxState::TxDone;
				trx.reg.status = TrxStatus::ChannelAccessFailure;
				self.trx_interrupt(n, TRX_IRQ_TX_END);
				Ok(())
			} else {
				self.trx_csma_backoff(n)
			}
		}
	}

	fn trx_transmit_frame(&mut self, n: usize) -> Result<()> {
		let trx = &mut self.nodes[n].trx;
		trx.tx = true;

		let symbols = PHY_SHR_DURATION
			+ PHY_PHR_DURATION
			+ u64::from(trx.tx_data[PHY_PHR_OFFSET]) * SYMBOLS_PER_OCTET;
		self.trx_add_tx_event(n, symbols * SYMBOL_DURATION, EventFn::TxEnd)?;
		self.medium_tx_start(n)
	}

	pub(crate) fn trx_tx_end(&mut self, n: usize) -> Result<()> {
		let state = self.nodes[n].trx.reg.state;
		if state != TrxState::TxWaitEnd && state != TrxState::TxWaitEndAack {
			return Err(self.invalid_trx_state(n, "TX end"));
		}

		self.nodes[n].trx.tx = false;
		self.medium_tx_end(n, true)?;

		if self.nodes[n].trx.config(TrxConfig::TX_EXTENDED) {
			debug!("{}: ... TX end extended", self.nodes[n].name);

			if state == TrxState::TxWaitEndAack {
				debug!("{}: ACK sent", self.nodes[n].name);
				self.nodes[n].trx.reg.state = TrxState::RxDone;
				Ok(())
			} else {
				let fcf = Fcf::parse(&self.nodes[n].trx.tx_data);

				if fcf.ack_request() {
					debug!("{}: ... waiting for an ACK", self.nodes[n].name);
					self.nodes[n].trx.reg.state = TrxState::TxWaitAck;
					self.trx_add_tx_event(n, ACK_WAIT_DURATION, EventFn::AckTimeout)?;
					self.trx_receive(n);
					Ok(())
				} else {
					let trx = &mut self.nodes[n].trx;
					trx.reg.state = TrxState::TxDone;
					trx.reg.status = TrxStatus::Success;
					self.trx_interrupt(n, TRX_IRQ_TX_END);
					Ok(())
				}
			}
		} else {
			debug!("{}: ... TX end basic", self.nodes[n].name);
			let trx = &mut self.nodes[n].trx;
			trx.reg.state = TrxState::TxDone;
			trx.reg.status = TrxStatus::Success;
			self.trx_interrupt(n, TRX_IRQ_TX_END);
			Ok(())
		}
	}

	pub(crate) fn trx_ack_wait_timeout(&mut self, n: usize) -> Result<()> {
		let state = self.nodes[n].trx.reg.state;
		if state != TrxState::TxWaitAck && state != TrxState::RxWaitEndAack {
			return Err(self.invalid_trx_state(n, "ACK wait timeout"));
		}

		debug!("{}: ... ACK wait timeout", self.nodes[n].name);

		let trx = &mut self.nodes[n].trx;
		trx.rx = false;
		trx.rx_trx_lock = false;
		self.events.remove(EventSlot::TrxRx(n));

		let trx = &mut self.nodes[n].trx;
		trx.tx_frame_ret += 1;

		if trx.tx_frame_ret > trx.reg.frame_retries {
			debug!("{}: ... no ACK received", self.nodes[n].name);

			let trx = &mut self.nodes[n].trx;
			trx.reg.state = TrxState::TxDone;
			trx.reg.status = TrxStatus::NoAck;
			self.trx_interrupt(n, TRX_IRQ_TX_END);
			Ok(())
		} else {
			debug!("{}: ... frame retry", self.nodes[n].name);

			let trx = &mut self.nodes[n].trx;
			trx.tx_csma_be = trx.reg.csma_min_be;
			trx.tx_csma_ret = 0;
			self.trx_csma_backoff(n)
		}
	}

	/// The medium selected us as a receiver for a starting transmission.
	pub(crate) fn trx_rx_start(&mut self, n: usize) -> Result<()> {
		let sender = self.nodes[n].trx.rx_trx.expect("rx_start without sender");
		let data = self.nodes[sender].trx.tx_data;

		{
			let from = self.nodes[sender].name.clone();
			debug!("{}: RX start from {}", self.nodes[n].name, from);
		}

		let state = self.nodes[n].trx.reg.state;
		let next = match state {
			TrxState::Rx => TrxState::RxWaitEnd,
			TrxState::TxWaitAck => TrxState::RxWaitEndAack,
			_ => return Err(self.invalid_trx_state(n, "RX start")),
		};

		let trx = &mut self.nodes[n].trx;
		trx.reg.state = next;
		trx.rx_lqi = 1.0;
		trx.rx_crc_ok = true;
		trx.rx_trx_lock = true;
		trx.buf = data;

		let symbols = PHY_SHR_DURATION
			+ PHY_PHR_DURATION
			+ u64::from(data[PHY_PHR_OFFSET]) * SYMBOLS_PER_OCTET;
		// Stop receiving 1 us before the transmission ends to give the
		// receiver a chance to update RSSI and LQI for the last time.
		self.trx_add_rx_event(n, symbols * SYMBOL_DURATION - 1, EventFn::RxEnd)?;
		self.trx_interrupt(n, TRX_IRQ_RX_START);
		Ok(())
	}

	/// The sender we were latched onto stopped transmitting. On an abort
	/// the frame is damaged but the latch stays until our own
	/// end-of-reception fires, so that a restart from the same sender does
	/// not re-trigger reception.
	pub(crate) fn trx_rx_interrupted(&mut self, n: usize) {
		let trx = &mut self.nodes[n].trx;
		trx.rx_trx = None;
		trx.rx_crc_ok = false;
	}

	pub(crate) fn trx_rx_end(&mut self, n: usize) -> Result<()> {
		self.medium_update(n);

		let trx = &mut self.nodes[n].trx;
		trx.rx = false;
		trx.rx_trx_lock = false;

		let state = trx.reg.state;
		let rx_lqi = trx.rx_lqi;
		if state != TrxState::RxWaitEnd && state != TrxState::RxWaitEndAack {
			return Err(self.invalid_trx_state(n, "RX end"));
		}

		// Approximates the LQI dependency of a real radio.
		let p_loss = (((0.5 - rx_lqi) * 5.5).tanh() + 1.0) / 2.0;
		let random = self.rand.next_f();

		if p_loss > random {
			debug!(
				"{}: Frame is randomly lost due to LQI (P_loss = {:.5}, random = {:.5})",
				self.nodes[n].name, p_loss, random
			);
			self.nodes[n].trx.rx_crc_ok = false;
		}

		let trx = &mut self.nodes[n].trx;
		if !trx.rx_crc_ok {
			// Damage the buffer so a manual CRC check fails too.
			trx.buf[1] ^= 0xff;
		}

		trx.rx_crc_ok = trx.rx_crc_ok && check_crc(&trx.buf);
		trx.reg.status = if trx.rx_crc_ok {
			TrxStatus::CrcOk
		} else {
			TrxStatus::CrcFail
		};
		trx.reg.frame_lqi = (trx.rx_lqi * 255.0).round() as u32;
		trx.reg.frame_rssi = trx.rx_rssi;

		debug!(
			"{}: RX end, LQI = {:.2} ({}), RSSI = {:.2}, CRC = {}",
			self.nodes[n].name,
			self.nodes[n].trx.rx_lqi,
			self.nodes[n].trx.reg.frame_lqi,
			self.nodes[n].trx.rx_rssi,
			if self.nodes[n].trx.rx_crc_ok { "OK" } else { "Fail" }
		);

		if self.nodes[n].trx.config(TrxConfig::TX_EXTENDED) {
			let header = MacHeader::parse(&self.nodes[n].trx.buf);

			if state == TrxState::RxWaitEndAack {
				let trx = &self.nodes[n].trx;
				if header.valid
					&& header.frame_type == FRAME_TYPE_ACK
					&& trx.tx_data[MAC_SEQ_OFFSET] == header.seq_no
				{
					debug!("{}: ... valid ACK received", self.nodes[n].name);

					self.events.remove(EventSlot::TrxTx(n));

					let trx = &mut self.nodes[n].trx;
					trx.reg.state = TrxState::TxDone;
					trx.reg.status = TrxStatus::Success;
					self.trx_interrupt(n, TRX_IRQ_TX_END);
				} else {
					let trx = &mut self.nodes[n].trx;
					trx.rx = true;
					trx.reg.state = TrxState::TxWaitAck;
				}
				Ok(())
			} else if self.nodes[n].trx.filter_frame(&header) {
				let trx = &self.nodes[n].trx;
				let disable_ack = trx.config(TrxConfig::AACK_DISABLE_ACK);
				let frame_pending = trx.config(TrxConfig::AACK_PENDING);

				if header.ack_request && !disable_ack {
					let trx = &mut self.nodes[n].trx;
					trx.tx_data[0] = MAC_ACK_SIZE;
					trx.tx_data[1] = if frame_pending { 0x12 } else { 0x02 };
					trx.tx_data[2] = 0x00;
					trx.tx_data[3] = header.seq_no;
					trx.tx_data[4] = 0xff; // CRC placeholder
					trx.tx_data[5] = 0xff;
					insert_crc(&mut trx.tx_data);

					trx.reg.state = TrxState::RxWaitAckTimeout;
					self.trx_add_rx_event(
						n,
						TURNAROUND_TIME * SYMBOL_DURATION,
						EventFn::TxAck,
					)?;
					self.trx_interrupt(n, TRX_IRQ_RX_END);
				} else {
					self.nodes[n].trx.reg.state = TrxState::RxDone;
					self.trx_interrupt(n, TRX_IRQ_RX_END);
				}
				Ok(())
			} else {
				self.nodes[n].trx.reg.state = TrxState::Rx;
				self.trx_receive(n);
				Ok(())
			}
		} else if self.nodes[n].trx.config(TrxConfig::RX_AUTO_CRC)
			&& !self.nodes[n].trx.rx_crc_ok
		{
			self.nodes[n].trx.reg.state = TrxState::Rx;
			self.trx_receive(n);
			Ok(())
		} else {
			self.nodes[n].trx.reg.state = TrxState::RxDone;
			self.trx_interrupt(n, TRX_IRQ_RX_END);
			Ok(())
		}
	}

	pub(crate) fn trx_tx_ack(&mut self, n: usize) -> Result<()> {
		if self.nodes[n].trx.reg.state != TrxState::RxWaitAckTimeout {
			return Err(self.invalid_trx_state(n, "ACK transmit"));
		}

		debug!("{}: Sending an ACK", self.nodes[n].name);

		self.nodes[n].trx.reg.state = TrxState::TxWaitEndAack;
		self.trx_transmit_frame(n)
	}

	fn trx_cca_ok(&mut self, n: usize) -> Result<bool> {
		let trx = &self.nodes[n].trx;
		let thr = trx.reg.ed_threshold;

		match trx.reg.cca_mode {
			0 => Ok(trx.rx_rssi < thr),
			1 => Ok(trx.rx_carrier < thr),
			2 => Ok(trx.rx_carrier < thr && trx.rx_rssi < thr),
			3 => Ok(trx.rx_carrier < thr || trx.rx_rssi < thr),
			4 => Ok(true),
			mode => Err(Error::InvalidCcaMode {
				node: self.nodes[n].name.clone(),
				mode,
			}),
		}
	}

	fn trx_add_tx_event(&mut self, n: usize, timeout: u64, callback: EventFn) -> Result<()> {
		let slot = EventSlot::TrxTx(n);
		if self.events.is_planned(slot) {
			return Err(Error::EventAlreadyPlanned {
				node: self.nodes[n].name.clone(),
				kind: "TX",
			});
		}
		self.events.add(self.cycle, timeout, Event { slot, callback });
		Ok(())
	}

	fn trx_add_rx_event(&mut self, n: usize, timeout: u64, callback: EventFn) -> Result<()> {
		let slot = EventSlot::TrxRx(n);
		if self.events.is_planned(slot) {
			return Err(Error::EventAlreadyPlanned {
				node: self.nodes[n].name.clone(),
				kind: "RX",
			});
		}
		self.events.add(self.cycle, timeout, Event { slot, callback });
		Ok(())
	}

	/// Latches the given status bits under the interrupt mask and raises
	/// the TRX IRQ line if any were retained.
	fn trx_interrupt(&mut self, n: usize, status: u32) {
		let trx = &mut self.nodes[n].trx;
		let retained = status & trx.reg.irq_mask;
		trx.reg.irq_status |= retained;

		if retained != 0 {
			self.nodes[n].cpu.irq_set(SOC_IRQ_TRX);
		}
	}

	fn invalid_trx_state(&self, n: usize, ctx: &'static str) -> Error {
		Error::InvalidTrxState {
			node: self.nodes[n].name.clone(),
			ctx,
			state: self.nodes[n].trx.reg.state.into(),
		}
	}
}

pub(crate) const FRAME_TYPE_BEACON: u8 = 0;
pub(crate) const FRAME_TYPE_DATA: u8 = 1;
pub(crate) const FRAME_TYPE_ACK: u8 = 2;
pub(crate) const FRAME_TYPE_COMMAND: u8 = 3;

const ADDR_MODE_NONE: u8 = 0;
const ADDR_MODE_SHORT: u8 = 2;
const ADDR_MODE_EXT: u8 = 3;

/// The two-byte frame control field at the start of every MAC frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fcf(u16);

impl Fcf {
	/// Reads the FCF of the PSDU in a PHY frame buffer.
	fn parse(frame: &[u8; 128]) -> Self {
		Self(u16::from_le_bytes([frame[1], frame[2]]))
	}

	fn frame_type(self) -> u8 {
		(self.0 & 0x07) as u8
	}

	fn ack_request(self) -> bool {
		self.0 & (1 << 5) != 0
	}

	fn pan_id_comp(self) -> bool {
		self.0 & (1 << 6) != 0
	}

	fn dst_addr_mode(self) -> u8 {
		((self.0 >> 10) & 0x03) as u8
	}

	fn frame_version(self) -> u8 {
		((self.0 >> 12) & 0x03) as u8
	}

	fn src_addr_mode(self) -> u8 {
		((self.0 >> 14) & 0x03) as u8
	}
}

/// A parsed MAC header; `valid` is false when the frame is shorter than
/// its addressing fields claim.
#[derive(Debug, Default)]
pub(crate) struct MacHeader {
	pub valid: bool,
	pub frame_type: u8,
	pub frame_version: u8,
	pub dst_addr_mode: u8,
	pub src_addr_mode: u8,
	pub ack_request: bool,
	pub seq_no: u8,
	pub dst_pan_id: u16,
	pub dst_short_addr: u16,
	pub dst_ext_addr: u64,
	pub src_pan_id: u16,
}

impl MacHeader {
	pub(crate) fn parse(frame: &[u8; 128]) -> Self {
		let mut header = Self::default();

		let size = frame[PHY_PHR_OFFSET];
		if size < MAC_ACK_SIZE {
			return header;
		}

		let fcf = Fcf::parse(frame);
		header.frame_type = fcf.frame_type();
		header.frame_version = fcf.frame_version();
		header.dst_addr_mode = fcf.dst_addr_mode();
		header.src_addr_mode = fcf.src_addr_mode();
		header.ack_request = fcf.ack_request();

		let mut at = 3usize;
		let mut left = i32::from(size) - 2;

		header.seq_no = frame[at];
		at += 1;
		left -= 1;

		let mut take = |at: &mut usize, left: &mut i32, len: usize| -> u64 {
			let mut val = 0u64;
			for i in 0..len {
				val |= u64::from(frame[(*at + i) & 0x7f]) << (8 * i);
			}
			*at += len;
			*left -= len as i32;
			val
		};

		if header.dst_addr_mode != ADDR_MODE_NONE {
			header.dst_pan_id = take(&mut at, &mut left, 2) as u16;

			if header.dst_addr_mode == ADDR_MODE_SHORT {
				header.dst_short_addr = take(&mut at, &mut left, 2) as u16;
			} else {
				header.dst_ext_addr = take(&mut at, &mut left, 8);
			}
		}

		if header.src_addr_mode != ADDR_MODE_NONE {
			if !fcf.pan_id_comp() {
				header.src_pan_id = take(&mut at, &mut left, 2) as u16;
			}

			if header.src_addr_mode == ADDR_MODE_SHORT {
				take(&mut at, &mut left, 2);
			} else {
				take(&mut at, &mut left, 8);
			}
		}

		header.valid = left >= 0;
		header
	}
}

impl Trx {
	/// MAC frame filtering for extended receive mode. Returns true when
	/// the frame is delivered to the application.
	pub(crate) fn filter_frame(&self, header: &MacHeader) -> bool {
		let reserved = header.frame_type > FRAME_TYPE_COMMAND;
		let pan_id = self.reg.pan_id as u16;
		let short_addr = self.reg.short_addr as u16;
		let ieee_addr =
			(u64::from(self.reg.ieee_addr_1) << 32) | u64::from(self.reg.ieee_addr_0);
		let is_coord = self.config(TrxConfig::AACK_COORD);

		if !header.valid || !self.rx_crc_ok {
			return false;
		}

		if reserved && !self.config(TrxConfig::AACK_RECV_RES) {
			return false;
		}

		if reserved && !self.config(TrxConfig::AACK_FLT_RES) {
			return true;
		}

		let ver_bit = TrxConfig::from_bits_retain(
			TrxConfig::AACK_FRAME_VER_0.bits() << header.frame_version,
		);
		if !self.config(ver_bit) {
			return false;
		}

		if header.dst_addr_mode == ADDR_MODE_SHORT || header.dst_addr_mode == ADDR_MODE_EXT {
			if pan_id != header.dst_pan_id && header.dst_pan_id != MAC_BROADCAST_PANID {
				return false;
			}
		}

		if header.dst_addr_mode == ADDR_MODE_SHORT {
			if short_addr != header.dst_short_addr
				&& header.dst_short_addr != MAC_BROADCAST_ADDR
			{
				return false;
			}
		} else if header.dst_addr_mode == ADDR_MODE_EXT && ieee_addr != header.dst_ext_addr {
			return false;
		}

		if header.frame_type == FRAME_TYPE_BEACON
			&& pan_id != MAC_BROADCAST_PANID
			&& header.src_pan_id != pan_id
		{
			return false;
		}

		if (header.frame_type == FRAME_TYPE_DATA || header.frame_type == FRAME_TYPE_COMMAND)
			&& (header.src_addr_mode == ADDR_MODE_SHORT
				|| header.src_addr_mode == ADDR_MODE_EXT)
			&& header.dst_addr_mode == ADDR_MODE_NONE
			&& !(is_coord && header.src_pan_id == pan_id)
		{
			return false;
		}

		if header.frame_type == FRAME_TYPE_ACK {
			return false;
		}

		if header.src_addr_mode == ADDR_MODE_NONE && header.dst_addr_mode == ADDR_MODE_NONE {
			return false;
		}

		true
	}
}

fn crc_ccitt_update(crc: u16, data: u8) -> u16 {
	let mut data = data ^ (crc & 0xff) as u8;
	data ^= data << 4;

	((u16::from(data) << 8) | (crc >> 8)) ^ u16::from(data >> 4) ^ (u16::from(data) << 3)
}

/// Overwrites the last two PSDU bytes with the CCITT CRC of the payload.
pub(crate) fn insert_crc(data: &mut [u8; 128]) {
	let size = data[PHY_PHR_OFFSET].saturating_sub(PHY_CRC_SIZE) as usize;

	let mut crc = 0u16;
	for i in 0..size {
		crc = crc_ccitt_update(crc, data[i + 1]);
	}

	data[size + 1] = (crc & 0xff) as u8;
	data[size + 2] = (crc >> 8) as u8;
}

/// A frame passes iff the CRC over the full PSDU (including the trailing
/// CRC bytes) comes out zero.
pub(crate) fn check_crc(data: &[u8; 128]) -> bool {
	let size = data[PHY_PHR_OFFSET] as usize;

	let mut crc = 0u16;
	for i in 0..size {
		crc = crc_ccitt_update(crc, data[i + 1]);
	}

	crc == 0
}
