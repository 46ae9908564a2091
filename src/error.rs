//! Fatal error values surfaced by the simulator.
//!
//! Everything here aborts the simulation when it reaches `main`; benign
//! runtime conditions (CSMA failure, missing ACK, CRC damage) are status
//! bits on the transceiver and never take this path.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	/// Malformed configuration input, reported before the simulation starts.
	#[error("{file}:{line}:{col}: {msg}")]
	Config {
		file: String,
		line: usize,
		col: usize,
		msg: String,
	},

	#[error("cannot open configuration file {path}: {source}")]
	ConfigOpen {
		path: PathBuf,
		source: std::io::Error,
	},

	#[error("cannot open firmware file {path}: {source}")]
	FirmwareOpen {
		path: PathBuf,
		source: std::io::Error,
	},

	#[error("firmware file {path} is too big ({size} bytes, limit {limit})")]
	FirmwareTooBig {
		path: PathBuf,
		size: usize,
		limit: usize,
	},

	#[error("cannot create sniffer output file {path}: {source}")]
	SnifferCreate {
		path: PathBuf,
		source: std::io::Error,
	},

	#[error("cannot write to sniffer output file {path}: {source}")]
	SnifferWrite {
		path: PathBuf,
		source: std::io::Error,
	},

	/// An opcode no descriptor matches, or a 32-bit form we do not decode.
	#[error("{node}: undefined instruction {opcode:#06x} at {pc:#010x}")]
	UndefinedInstruction { node: String, opcode: u32, pc: u32 },

	/// A recognized instruction outside the supported subset.
	#[error("{node}: {instr} not implemented at {pc:#010x}")]
	NotImplemented {
		node: String,
		instr: &'static str,
		pc: u32,
	},

	#[error("{node}: invalid condition code at {pc:#010x}")]
	InvalidCondition { node: String, pc: u32 },

	/// A load or store that no peripheral claims, or a width a mapped
	/// peripheral does not support.
	#[error("{node}: unhandled {width} {op} @ {addr:#010x} (value {value:#x}) at {pc:#010x}")]
	UnhandledAccess {
		node: String,
		op: &'static str,
		width: &'static str,
		addr: u32,
		value: u32,
		pc: u32,
	},

	#[error("{node}: invalid state transition ({from} -> {to})")]
	InvalidStateTransition { node: String, from: u32, to: u32 },

	#[error("{node}: invalid transceiver state in {ctx}: {state}")]
	InvalidTrxState {
		node: String,
		ctx: &'static str,
		state: u32,
	},

	#[error("{node}: invalid CCA mode ({mode})")]
	InvalidCcaMode { node: String, mode: u32 },

	#[error("{node}: invalid frame size in transmit: {size}")]
	InvalidFrameSize { node: String, size: u8 },

	/// An event record was scheduled while already queued; this is a
	/// simulator or firmware bug and is never masked.
	#[error("{node}: another {kind} event is already planned")]
	EventAlreadyPlanned { node: String, kind: &'static str },
}
