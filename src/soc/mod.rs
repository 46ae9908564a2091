//! A simulated node: CPU, memory and memory-mapped peripherals.
//!
//! Every MMIO address decomposes as `(peripheral id, offset)` where the id
//! is the high byte and the offset the low 24 bits. The driver wires RAM at
//! id 0, SYS_CTRL at 1, the four SYS_TIMERs at 2..5 and the transceiver at
//! 0x40; accesses to any other id, and widths a mapped peripheral does not
//! implement, abort the simulation with a diagnostic.

pub mod sys_ctrl;
pub mod sys_timer;
pub mod trx;

use crate::Result;
use crate::cpu::{Cpu, PC, SP};
use crate::error::Error;
use crate::sim::Simulation;
use crate::soc::sys_timer::SysTimer;
use crate::soc::trx::Trx;

/// Flat per-node memory, flash and RAM overlaid. Must be a power of 2.
pub const RAM_SIZE: usize = 128 * 1024;
const RAM_MASK: u32 = (RAM_SIZE - 1) as u32;

const PERIPHERAL_SHIFT: u32 = 24;
const PERIPHERAL_MASK: u32 = 0x00ff_ffff;

/// RAM/flash.
pub const SOC_ID_RAM: u8 = 0x00;
/// Node identity, PRNG access, log sink, interrupt enables.
pub const SOC_ID_SYS_CTRL: u8 = 0x01;
/// First of the four system timers (0x02..=0x05).
pub const SOC_ID_SYS_TIMER_0: u8 = 0x02;
const SOC_ID_SYS_TIMER_3: u8 = 0x05;
/// The radio transceiver.
pub const SOC_ID_TRX: u8 = 0x40;

/// IRQ line of the transceiver.
pub const SOC_IRQ_TRX: u32 = 0;
/// IRQ line of system timer 0; timers 1..3 follow.
pub const SOC_IRQ_SYS_TIMER_0: u32 = 1;

pub(crate) const IRQ_LINES: u32 = 5;

pub struct Node {
	pub name: String,
	pub x: f32,
	pub y: f32,
	/// Application-visible identity (SYS_CTRL ID), not necessarily unique.
	pub id: u32,
	/// Unique sequential index; doubles as the transceiver uid.
	pub uid: usize,

	pub cpu: Cpu,
	pub ram: Box<[u8; RAM_SIZE]>,
	pub timers: [SysTimer; 4],
	pub trx: Trx,
}

impl Node {
	pub(crate) fn new(name: String, x: f32, y: f32, id: u32, uid: usize, image: &[u8]) -> Self {
		let mut ram = vec![0u8; RAM_SIZE].into_boxed_slice();
		ram[..image.len()].copy_from_slice(image);
		let ram: Box<[u8; RAM_SIZE]> = ram.try_into().unwrap();

		let mut node = Self {
			name,
			x,
			y,
			id,
			uid,
			cpu: Cpu::new(),
			ram,
			timers: [SysTimer::new(), SysTimer::new(), SysTimer::new(), SysTimer::new()],
			trx: Trx::new(uid),
		};
		node.reset();
		node
	}

	/// Thumb boot convention: word 0 of the image is the initial stack
	/// pointer, word 1 the reset vector.
	fn reset(&mut self) {
		self.cpu = Cpu::new();
		self.cpu.r[SP] = self.ram_read_w(0);
		self.cpu.r[PC] = self.ram_read_w(4) & !1;
	}

	pub fn ram_read_b(&self, addr: u32) -> u8 {
		self.ram[(addr & RAM_MASK) as usize]
	}

	pub fn ram_read_h(&self, addr: u32) -> u16 {
		let at = (addr & RAM_MASK & !1) as usize;
		u16::from_le_bytes([self.ram[at], self.ram[at + 1]])
	}

	pub fn ram_read_w(&self, addr: u32) -> u32 {
		let at = (addr & RAM_MASK & !3) as usize;
		u32::from_le_bytes(self.ram[at..at + 4].try_into().unwrap())
	}

	pub fn ram_write_b(&mut self, addr: u32, data: u8) {
		self.ram[(addr & RAM_MASK) as usize] = data;
	}

	pub fn ram_write_h(&mut self, addr: u32, data: u16) {
		let at = (addr & RAM_MASK & !1) as usize;
		self.ram[at..at + 2].copy_from_slice(&data.to_le_bytes());
	}

	pub fn ram_write_w(&mut self, addr: u32, data: u32) {
		let at = (addr & RAM_MASK & !3) as usize;
		self.ram[at..at + 4].copy_from_slice(&data.to_le_bytes());
	}

	fn unhandled(&self, op: &'static str, width: &'static str, addr: u32, value: u32) -> Error {
		Error::UnhandledAccess {
			node: self.name.clone(),
			op,
			width,
			addr,
			value,
			pc: self.cpu.r[PC],
		}
	}
}

impl Simulation {
	pub fn read_b(&mut self, n: usize, addr: u32) -> Result<u8> {
		let off = addr & PERIPHERAL_MASK;
		match (addr >> PERIPHERAL_SHIFT) as u8 {
			SOC_ID_RAM => Ok(self.nodes[n].ram_read_b(off)),
			SOC_ID_TRX => Ok(self.nodes[n].trx.read_b(off)),
			_ => Err(self.nodes[n].unhandled("read", "byte", addr, 0)),
		}
	}

	pub fn read_h(&mut self, n: usize, addr: u32) -> Result<u16> {
		let off = addr & PERIPHERAL_MASK;
		match (addr >> PERIPHERAL_SHIFT) as u8 {
			SOC_ID_RAM => Ok(self.nodes[n].ram_read_h(off)),
			_ => Err(self.nodes[n].unhandled("read", "halfword", addr, 0)),
		}
	}

	pub fn read_w(&mut self, n: usize, addr: u32) -> Result<u32> {
		let off = addr & PERIPHERAL_MASK;
		match (addr >> PERIPHERAL_SHIFT) as u8 {
			SOC_ID_RAM => Ok(self.nodes[n].ram_read_w(off)),
			SOC_ID_SYS_CTRL => Ok(self.sys_ctrl_read_w(n, off)),
			id @ SOC_ID_SYS_TIMER_0..=SOC_ID_SYS_TIMER_3 => {
				let timer = (id - SOC_ID_SYS_TIMER_0) as usize;
				Ok(self.nodes[n].timers[timer].read_w(off))
			}
			SOC_ID_TRX => Ok(self.nodes[n].trx.read_w(off)),
			_ => Err(self.nodes[n].unhandled("read", "word", addr, 0)),
		}
	}

	pub fn write_b(&mut self, n: usize, addr: u32, data: u8) -> Result<()> {
		let off = addr & PERIPHERAL_MASK;
		match (addr >> PERIPHERAL_SHIFT) as u8 {
			SOC_ID_RAM => {
				self.nodes[n].ram_write_b(off, data);
				Ok(())
			}
			SOC_ID_TRX => {
				self.nodes[n].trx.write_b(off, data);
				Ok(())
			}
			_ => Err(self.nodes[n].unhandled("write", "byte", addr, data.into())),
		}
	}

	pub fn write_h(&mut self, n: usize, addr: u32, data: u16) -> Result<()> {
		let off = addr & PERIPHERAL_MASK;
		match (addr >> PERIPHERAL_SHIFT) as u8 {
			SOC_ID_RAM => {
				self.nodes[n].ram_write_h(off, data);
				Ok(())
			}
			_ => Err(self.nodes[n].unhandled("write", "halfword", addr, data.into())),
		}
	}

	pub fn write_w(&mut self, n: usize, addr: u32, data: u32) -> Result<()> {
		let off = addr & PERIPHERAL_MASK;
		match (addr >> PERIPHERAL_SHIFT) as u8 {
			SOC_ID_RAM => {
				self.nodes[n].ram_write_w(off, data);
				Ok(())
			}
			SOC_ID_SYS_CTRL => {
				self.sys_ctrl_write_w(n, off, data);
				Ok(())
			}
			id @ SOC_ID_SYS_TIMER_0..=SOC_ID_SYS_TIMER_3 => {
				let timer = (id - SOC_ID_SYS_TIMER_0) as usize;
				self.sys_timer_write_w(n, timer, off, data);
				Ok(())
			}
			SOC_ID_TRX => self.trx_write_w(n, off, data),
			_ => Err(self.nodes[n].unhandled("write", "word", addr, data)),
		}
	}
}
