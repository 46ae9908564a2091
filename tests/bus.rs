//! Peripheral scenarios driven through the MMIO register file: the radio
//! state machine over the medium, and the system timer's bus-visible
//! behavior. The nodes run empty firmware images; the tests poke registers
//! the way firmware would and advance the driver loop.

use motesim::Simulation;
use motesim::sniffer::Sniffer;
use motesim::soc::trx::{TrxState, TrxStatus};

const TRX: u32 = 0x4000_0000;
const CONFIG: u32 = TRX;
const PAN_ID: u32 = TRX + 0x04;
const SHORT_ADDR: u32 = TRX + 0x08;
const STATE: u32 = TRX + 0x24;
const STATUS: u32 = TRX + 0x28;
const IRQ_MASK: u32 = TRX + 0x2c;
const IRQ_STATUS: u32 = TRX + 0x30;
const FRAME_LQI: u32 = TRX + 0x50;
const FRAME_BUFFER: u32 = TRX + 0x1000;

const IRQ_RX_END: u32 = 1 << 1;
const IRQ_TX_END: u32 = 1 << 2;

const STATE_IDLE: u32 = 0;
const STATE_TX: u32 = 2;
const STATE_RX: u32 = 8;

const CFG_TX_AUTO_CRC: u32 = 1 << 0;
const CFG_RX_AUTO_CRC: u32 = 1 << 1;

/// Advances simulated time through the regular driver loop.
fn run_for(sim: &mut Simulation, cycles: u64) {
	sim.end_time = sim.cycle + cycles;
	sim.run().unwrap();
}

/// Loads a PHY frame into a node's frame buffer: a data frame with short
/// destination addressing and the given payload.
fn load_data_frame(
	sim: &mut Simulation,
	n: usize,
	seq: u8,
	dst_pan: u16,
	dst: u16,
	ack: bool,
	payload: &[u8],
) {
	let fcf: u16 = 0x0801 | if ack { 0x20 } else { 0 };

	let mut psdu = Vec::new();
	psdu.extend_from_slice(&fcf.to_le_bytes());
	psdu.push(seq);
	psdu.extend_from_slice(&dst_pan.to_le_bytes());
	psdu.extend_from_slice(&dst.to_le_bytes());
	psdu.extend_from_slice(payload);

	sim.write_b(n, FRAME_BUFFER, (psdu.len() + 2) as u8).unwrap();
	for (i, byte) in psdu.iter().enumerate() {
		sim.write_b(n, FRAME_BUFFER + 1 + i as u32, *byte).unwrap();
	}
}

fn two_nodes() -> Simulation {
	let mut sim = Simulation::new();
	sim.add_node("a", 0.0, 0.0, 1, &[]).unwrap();
	sim.add_node("b", 1.0, 0.0, 2, &[]).unwrap();
	sim
}

#[test]
fn basic_mode_crc_round_trip() {
	let mut sim = two_nodes();

	// Basic (non-extended) mode on both sides, auto CRC on.
	sim.write_w(0, CONFIG, CFG_TX_AUTO_CRC).unwrap();
	sim.write_w(1, CONFIG, CFG_RX_AUTO_CRC).unwrap();
	sim.write_w(1, IRQ_MASK, IRQ_RX_END).unwrap();
	sim.write_w(1, STATE, STATE_RX).unwrap();

	let payload = [0xaa, 0xbb, 0xcc, 0xdd];

	// The LQI-based random loss can eat an attempt; retry a few times.
	for _ in 0..5 {
		load_data_frame(&mut sim, 0, 7, 0x1234, 0x0042, false, &payload);
		sim.write_w(0, STATE, STATE_TX).unwrap();
		run_for(&mut sim, 2_000);

		assert_eq!(sim.nodes[0].trx.reg.state, TrxState::TxDone);
		sim.write_w(0, STATE, STATE_IDLE).unwrap();

		if sim.nodes[1].trx.reg.status == TrxStatus::CrcOk {
			break;
		}
	}

	assert_eq!(sim.nodes[1].trx.reg.status, TrxStatus::CrcOk);
	assert_eq!(sim.nodes[1].trx.reg.state, TrxState::RxDone);
	assert_ne!(sim.read_w(1, IRQ_STATUS).unwrap() & IRQ_RX_END, 0);

	// Payload bytes arrive unchanged.
	let rx = &sim.nodes[1].trx.buf;
	assert_eq!(rx[0], sim.nodes[0].trx.tx_data[0]);
	assert_eq!(&rx[8..12], &payload);
}

#[test]
fn auto_ack_round_trip() {
	let mut sim = two_nodes();

	// Extended mode is the reset default; address the receiver.
	sim.write_w(1, PAN_ID, 0x1234).unwrap();
	sim.write_w(1, SHORT_ADDR, 0x0042).unwrap();
	sim.write_w(0, IRQ_MASK, IRQ_TX_END).unwrap();
	sim.write_w(1, IRQ_MASK, IRQ_RX_END).unwrap();
	sim.write_w(1, STATE, STATE_RX).unwrap();

	load_data_frame(&mut sim, 0, 0x21, 0x1234, 0x0042, true, b"ping");
	sim.write_w(0, STATE, STATE_TX).unwrap();

	// Drive until the transmitter settles. If a random LQI loss ate the
	// ACK, the receiver is re-armed so the frame retry can land.
	let mut guard = 0;
	while sim.nodes[0].trx.reg.state != TrxState::TxDone && guard < 2_000 {
		run_for(&mut sim, 100);
		guard += 1;

		if sim.nodes[0].trx.reg.state != TrxState::TxDone
			&& sim.nodes[1].trx.reg.state == TrxState::RxDone
		{
			sim.write_w(1, STATE, STATE_RX).unwrap();
		}
	}

	// Let the receiver finish its ACK tail.
	run_for(&mut sim, 2_000);

	assert_eq!(sim.nodes[0].trx.reg.state, TrxState::TxDone);
	assert_eq!(sim.nodes[0].trx.reg.status, TrxStatus::Success);
	assert_ne!(sim.read_w(0, IRQ_STATUS).unwrap() & IRQ_TX_END, 0);

	// The receiver saw the frame and is parked after the ACK.
	assert_eq!(sim.nodes[1].trx.reg.state, TrxState::RxDone);
	assert_ne!(sim.read_w(1, IRQ_STATUS).unwrap() & IRQ_RX_END, 0);
	assert!(sim.read_w(1, FRAME_LQI).unwrap() <= 255);
	assert_eq!(&sim.nodes[1].trx.buf[8..12], b"ping");

	// CSMA stayed within its retry bound on every attempt.
	assert!(sim.nodes[0].trx.tx_csma_ret <= sim.nodes[0].trx.reg.csma_retries);
}

#[test]
fn no_ack_when_the_link_is_blocked() {
	let mut sim = two_nodes();

	// The peer cannot hear us at all.
	sim.nodes[0].trx.loss_trx.insert(1, 200.0);
	sim.nodes[1].trx.loss_trx.insert(0, 200.0);

	sim.write_w(1, PAN_ID, 0x1234).unwrap();
	sim.write_w(1, SHORT_ADDR, 0x0042).unwrap();
	sim.write_w(0, IRQ_MASK, IRQ_TX_END).unwrap();
	sim.write_w(1, IRQ_MASK, IRQ_RX_END).unwrap();
	sim.write_w(1, STATE, STATE_RX).unwrap();

	load_data_frame(&mut sim, 0, 0x31, 0x1234, 0x0042, true, b"void");
	sim.write_w(0, STATE, STATE_TX).unwrap();

	run_for(&mut sim, 200_000);

	assert_eq!(sim.nodes[0].trx.reg.state, TrxState::TxDone);
	assert_eq!(sim.nodes[0].trx.reg.status, TrxStatus::NoAck);
	assert_ne!(sim.read_w(0, IRQ_STATUS).unwrap() & IRQ_TX_END, 0);

	// Every attempt was sent; the receiver never started a frame.
	assert_eq!(
		sim.nodes[0].trx.tx_frame_ret,
		sim.nodes[0].trx.reg.frame_retries + 1
	);
	assert_eq!(sim.read_w(1, IRQ_STATUS).unwrap(), 0);
	assert_eq!(sim.nodes[1].trx.reg.state, TrxState::Rx);
}

#[test]
fn csma_gives_up_under_constant_noise() {
	let mut sim = two_nodes();

	// A strong interferer sits right next to the transmitter.
	sim.add_noise("jam", 0.1, 0.0, 2.40e9, 2.48e9, -30.0, 100, 0);
	sim.write_w(0, IRQ_MASK, IRQ_TX_END).unwrap();

	load_data_frame(&mut sim, 0, 1, 0x1234, 0x0042, true, b"jammed");
	sim.write_w(0, STATE, STATE_TX).unwrap();

	run_for(&mut sim, 300_000);

	assert_eq!(sim.nodes[0].trx.reg.state, TrxState::TxDone);
	assert_eq!(
		sim.nodes[0].trx.reg.status,
		TrxStatus::ChannelAccessFailure
	);
	assert_ne!(sim.read_w(0, IRQ_STATUS).unwrap() & IRQ_TX_END, 0);

	// Backoff ran exactly csma_retries + 1 times.
	assert_eq!(
		sim.nodes[0].trx.tx_csma_ret,
		sim.nodes[0].trx.reg.csma_retries + 1
	);
	// The transmission never hit the air.
	assert!(!sim.nodes[0].trx.tx);
	assert_eq!(
		sim.read_w(0, STATUS).unwrap(),
		u32::from(TrxStatus::ChannelAccessFailure)
	);
}

#[test]
fn broadcast_reaches_every_listener() {
	let mut sim = Simulation::new();
	sim.add_node("src", 0.0, 0.0, 0, &[]).unwrap();
	sim.add_node("rx1", 1.0, 0.0, 1, &[]).unwrap();
	sim.add_node("rx2", 0.0, 1.0, 2, &[]).unwrap();

	// Receivers sit on different PANs with different addresses.
	sim.write_w(1, PAN_ID, 0x1111).unwrap();
	sim.write_w(1, SHORT_ADDR, 0x0001).unwrap();
	sim.write_w(2, PAN_ID, 0x2222).unwrap();
	sim.write_w(2, SHORT_ADDR, 0x0002).unwrap();

	for n in [1, 2] {
		sim.write_w(n, IRQ_MASK, IRQ_RX_END).unwrap();
		sim.write_w(n, STATE, STATE_RX).unwrap();
	}

	// A handful of broadcast frames; the LQI loss may eat single
	// receptions but not all of them.
	for seq in 0..5 {
		load_data_frame(&mut sim, 0, seq, 0xffff, 0xffff, false, b"hello");
		sim.write_w(0, STATE, STATE_TX).unwrap();
		run_for(&mut sim, 10_000);

		sim.write_w(0, STATE, STATE_IDLE).unwrap();
		for n in [1, 2] {
			if sim.nodes[n].trx.reg.state == TrxState::RxDone {
				sim.write_w(n, STATE, STATE_RX).unwrap();
			}
		}
	}

	assert_ne!(sim.read_w(1, IRQ_STATUS).unwrap() & IRQ_RX_END, 0);
	assert_ne!(sim.read_w(2, IRQ_STATUS).unwrap() & IRQ_RX_END, 0);
}

#[test]
fn hidden_terminals_share_the_channel() {
	let mut sim = Simulation::new();
	sim.add_node("gw", 0.0, 0.0, 0, &[]).unwrap();
	sim.add_node("a", 0.0, 1.0, 1, &[]).unwrap();
	sim.add_node("c", 0.0, -1.0, 2, &[]).unwrap();

	// The two senders cannot hear each other, only the gateway can.
	sim.nodes[1].trx.loss_trx.insert(2, 200.0);
	sim.nodes[2].trx.loss_trx.insert(1, 200.0);

	sim.write_w(0, PAN_ID, 0x1234).unwrap();
	sim.write_w(0, SHORT_ADDR, 0x0001).unwrap();
	sim.write_w(0, STATE, STATE_RX).unwrap();

	let mut wins = [0u32; 2];

	for round in 0..40u8 {
		load_data_frame(&mut sim, 1, round, 0x1234, 0x0001, true, b"from-a");
		load_data_frame(&mut sim, 2, 0x80 | round, 0x1234, 0x0001, true, b"from-c");
		sim.write_w(1, STATE, STATE_TX).unwrap();
		sim.write_w(2, STATE, STATE_TX).unwrap();

		let both_done = |sim: &Simulation| {
			sim.nodes[1].trx.reg.state == TrxState::TxDone
				&& sim.nodes[2].trx.reg.state == TrxState::TxDone
		};

		let mut guard = 0;
		while !both_done(&sim) && guard < 2_000 {
			run_for(&mut sim, 100);
			guard += 1;

			// The gateway's firmware would re-arm reception after
			// consuming each frame.
			if sim.nodes[0].trx.reg.state == TrxState::RxDone {
				sim.write_w(0, STATE, STATE_RX).unwrap();
			}
		}
		assert!(both_done(&sim), "round {round} never settled");

		for (i, n) in [1, 2].into_iter().enumerate() {
			if sim.nodes[n].trx.reg.status == TrxStatus::Success {
				wins[i] += 1;
			}
			sim.write_w(n, STATE, STATE_IDLE).unwrap();
		}
		if sim.nodes[0].trx.reg.state == TrxState::RxDone {
			sim.write_w(0, STATE, STATE_RX).unwrap();
		}
	}

	// Neither sender starves: the backoff keeps giving both a shot.
	assert!(wins[0] >= 10, "a won only {} of 40 rounds", wins[0]);
	assert!(wins[1] >= 10, "c won only {} of 40 rounds", wins[1]);
}

#[test]
fn force_idle_cancels_everything() {
	let mut sim = two_nodes();

	sim.write_w(1, STATE, STATE_RX).unwrap();
	load_data_frame(&mut sim, 0, 9, 0xffff, 0xffff, false, b"cut");
	sim.write_w(0, STATE, STATE_TX).unwrap();

	// Wait out the backoff until the frame is in the air.
	let mut waited = 0;
	while !sim.nodes[0].trx.tx && waited < 10_000 {
		run_for(&mut sim, 1);
		waited += 1;
	}
	assert!(sim.nodes[0].trx.tx);
	assert_eq!(sim.nodes[1].trx.reg.state, TrxState::RxWaitEnd);

	// Yank the transmitter to IDLE mid-frame.
	sim.write_w(0, STATE, STATE_IDLE).unwrap();
	assert_eq!(sim.nodes[0].trx.reg.state, TrxState::Idle);
	assert!(!sim.nodes[0].trx.tx);

	// The receiver sees an aborted frame: no delivery, back to listening.
	run_for(&mut sim, 5_000);
	assert_ne!(sim.nodes[1].trx.reg.state, TrxState::RxDone);
	assert!(sim.events.is_empty());
}

#[test]
fn timer_counts_and_toggles_its_irq_line() {
	const TIMER0: u32 = 0x0200_0000;
	const PERIOD: u32 = TIMER0 + 0x04;
	const COUNTER: u32 = TIMER0 + 0x08;
	const INTENSET: u32 = TIMER0 + 0x10;
	const INTFLAG: u32 = TIMER0 + 0x18;
	const TIMER0_IRQ: u32 = 1 << 1;

	let mut sim = Simulation::new();
	sim.add_node("t", 0.0, 0.0, 0, &[]).unwrap();

	sim.write_w(0, PERIOD, 1_000).unwrap();
	sim.write_w(0, INTENSET, 1).unwrap();

	// Three full periods elapse, each one counted.
	run_for(&mut sim, 3_001);
	assert_eq!(sim.read_w(0, COUNTER).unwrap(), 3);
	assert_eq!(sim.read_w(0, INTFLAG).unwrap(), 1);
	assert_eq!(sim.nodes[0].cpu.irqs, TIMER0_IRQ);

	// Write-1-to-clear drops the flag and lowers the line.
	sim.write_w(0, INTFLAG, 1).unwrap();
	assert_eq!(sim.read_w(0, INTFLAG).unwrap(), 0);
	assert_eq!(sim.nodes[0].cpu.irqs, 0);

	// A zero period parks the timer for good.
	sim.write_w(0, PERIOD, 0).unwrap();
	run_for(&mut sim, 5_000);
	assert_eq!(sim.read_w(0, COUNTER).unwrap(), 3);
}

#[test]
fn capture_files_are_deterministic() {
	let dir = std::env::temp_dir();
	let path_a = dir.join("motesim_radio_cap_a.txt");
	let path_b = dir.join("motesim_radio_cap_b.txt");

	for path in [&path_a, &path_b] {
		let mut sim = two_nodes();
		let sniffer = Sniffer::create(
			"probe".into(),
			0,
			0.5,
			0.0,
			2.40e9,
			2.48e9,
			-200.0,
			path,
		)
		.unwrap();
		sim.add_sniffer(sniffer);

		sim.write_w(1, STATE, STATE_RX).unwrap();

		for seq in 0..3 {
			load_data_frame(&mut sim, 0, seq, 0xffff, 0xffff, false, b"cap");
			sim.write_w(0, STATE, STATE_TX).unwrap();
			run_for(&mut sim, 10_000);
			sim.write_w(0, STATE, STATE_IDLE).unwrap();
			if sim.nodes[1].trx.reg.state == TrxState::RxDone {
				sim.write_w(1, STATE, STATE_RX).unwrap();
			}
		}
	}

	let a = std::fs::read(&path_a).unwrap();
	let b = std::fs::read(&path_b).unwrap();
	assert!(!a.is_empty());
	assert_eq!(a, b);

	let text = String::from_utf8(a).unwrap();
	assert!(text.starts_with("#Format=4\r\n# SNA v5.5.5.5 SUS:20140418 ACT:000000\r\n"));
	// Three frames, sequence numbers counting from 1.
	let frames: Vec<&str> = text.lines().skip(2).collect();
	assert_eq!(frames.len(), 3);
	assert!(frames[0].starts_with("1 "));
	assert!(frames[2].starts_with("3 "));
	// The capture blanks the CRC bytes.
	assert!(frames[0].contains("ffff "));

	let _ = std::fs::remove_file(path_a);
	let _ = std::fs::remove_file(path_b);
}
