//! Passive capture receivers.
//!
//! A sniffer listens on a frequency band with a sensitivity threshold and
//! writes every frame it hears to a line-oriented capture file. The format
//! is byte-stable: it is part of the determinism contract.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::Result;
use crate::error::Error;

pub struct Sniffer {
	pub name: String,
	pub uid: usize,
	pub x: f32,
	pub y: f32,
	/// Band limits in Hz.
	pub freq_a: f32,
	pub freq_b: f32,
	/// dBm; weaker frames are not captured.
	pub sensitivity: f32,
	/// Extra path loss towards nodes, keyed by node uid.
	pub loss_trx: HashMap<usize, f32, ahash::RandomState>,

	path: PathBuf,
	file: File,
	seq: u32,
}

impl Sniffer {
	pub fn create(
		name: String,
		uid: usize,
		x: f32,
		y: f32,
		freq_a: f32,
		freq_b: f32,
		sensitivity: f32,
		path: &Path,
	) -> Result<Self> {
		let file = File::create(path).map_err(|source| Error::SnifferCreate {
			path: path.to_path_buf(),
			source,
		})?;

		let mut sniffer = Self {
			name,
			uid,
			x,
			y,
			freq_a,
			freq_b,
			sensitivity,
			loss_trx: HashMap::default(),
			path: path.to_path_buf(),
			file,
			seq: 1,
		};

		sniffer.write(b"#Format=4\r\n")?;
		sniffer.write(b"# SNA v5.5.5.5 SUS:20140418 ACT:000000\r\n")?;

		Ok(sniffer)
	}

	pub(crate) fn write_frame(&mut self, cycle: u64, data: &[u8; 128], power: f32) -> Result<()> {
		let line = frame_line(self.seq, cycle, data, power);
		self.seq += 1;
		self.write(line.as_bytes())
	}

	fn write(&mut self, bytes: &[u8]) -> Result<()> {
		self.file.write_all(bytes).map_err(|source| Error::SnifferWrite {
			path: self.path.clone(),
			source,
		})
	}
}

/// One capture line: seq, time in seconds, size, hex data with the CRC
/// bytes blanked to `ffff`, then fixed LQI/CRC/channel columns and the
/// rounded received power.
fn frame_line(seq: u32, cycle: u64, data: &[u8; 128], power: f32) -> String {
	let size = data[0] as usize;

	let mut hex = String::with_capacity(size * 2);
	for i in 0..size.saturating_sub(2) {
		hex.push_str(&format!("{:02x}", data[i + 1]));
	}
	hex.push_str("ffff");

	format!(
		"{} {:.6} {} {} 255 1 {} 15 0 0 1 32767\r\n",
		seq,
		cycle as f64 / 1_000_000.0,
		size,
		hex,
		power.round() as i32
	)
}
