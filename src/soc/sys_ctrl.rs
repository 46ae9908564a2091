//! SYS_CTRL: node identity, entropy, the host log sink and the CPU's
//! interrupt enable mask. Word access only.

use crate::sim::Simulation;
use crate::soc::RAM_SIZE;

/// Unique sequential node index (read-only).
pub const SYS_CTRL_UID: u32 = 0x00;
/// Application-visible identity from the configuration (read-only).
pub const SYS_CTRL_ID: u32 = 0x04;
/// Next PRNG word (read-only).
pub const SYS_CTRL_RAND: u32 = 0x08;
/// Write a RAM address holding a NUL-terminated string to emit it to the
/// host log.
pub const SYS_CTRL_LOG: u32 = 0x0c;
/// Read: current IRQ enable mask. Write: set the given bits.
pub const SYS_CTRL_INTENSET: u32 = 0x10;
/// Read: current IRQ enable mask. Write: clear the given bits.
pub const SYS_CTRL_INTENCLR: u32 = 0x14;

impl Simulation {
	pub(crate) fn sys_ctrl_read_w(&mut self, n: usize, addr: u32) -> u32 {
		match addr {
			SYS_CTRL_UID => self.nodes[n].uid as u32,
			SYS_CTRL_ID => self.nodes[n].id,
			SYS_CTRL_RAND => self.rand.next(),
			SYS_CTRL_INTENSET | SYS_CTRL_INTENCLR => self.nodes[n].cpu.irq_en,
			_ => 0,
		}
	}

	pub(crate) fn sys_ctrl_write_w(&mut self, n: usize, addr: u32, data: u32) {
		match addr {
			SYS_CTRL_LOG => {
				if (data as usize) < RAM_SIZE {
					let node = &self.nodes[n];
					let mut end = data as usize;
					while end < RAM_SIZE && node.ram[end] != 0 {
						end += 1;
					}
					let msg = String::from_utf8_lossy(&node.ram[data as usize..end]);
					info!("{}: {}", node.name, msg);
				}
			}
			SYS_CTRL_INTENSET => self.nodes[n].cpu.irq_en |= data,
			SYS_CTRL_INTENCLR => self.nodes[n].cpu.irq_en &= !data,
			_ => {}
		}
	}
}
