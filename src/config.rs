//! Configuration file parsing.
//!
//! Line-based: `#` introduces a comment, blank lines are ignored, every
//! other line is a command with whitespace-separated arguments. Errors
//! carry `file:line:column` so a typo is reported where it sits; columns
//! honor tab stops of 8 like the editors the format grew up with.

use std::fs;
use std::path::Path;

use crate::Result;
use crate::error::Error;
use crate::sim::Simulation;
use crate::sniffer::Sniffer;
use crate::soc::RAM_SIZE;
use crate::MHZ;

/// Reads a configuration file and builds the simulation it describes.
/// Firmware and capture paths are resolved relative to the working
/// directory.
pub fn load(path: &Path) -> Result<Simulation> {
	let text = fs::read_to_string(path).map_err(|source| Error::ConfigOpen {
		path: path.to_path_buf(),
		source,
	})?;

	let mut sim = Simulation::new();
	parse(&mut sim, &path.to_string_lossy(), &text)?;
	Ok(sim)
}

/// Applies configuration text to a simulation. The PRNG is reseeded once
/// the whole text is read, whatever line the `seed` command sat on.
pub fn parse(sim: &mut Simulation, file: &str, text: &str) -> Result<()> {
	for (i, line) in text.lines().enumerate() {
		let mut cursor = Cursor::new(file, i + 1, line);
		process_line(sim, &mut cursor)?;
	}

	sim.set_seed(sim.seed);
	Ok(())
}

struct Cursor<'a> {
	file: &'a str,
	line: usize,
	col: usize,
	rest: &'a str,
}

impl<'a> Cursor<'a> {
	fn new(file: &'a str, line: usize, rest: &'a str) -> Self {
		Self {
			file,
			line,
			col: 1,
			rest: rest.strip_suffix('\r').unwrap_or(rest),
		}
	}

	fn err(&self, msg: impl Into<String>) -> Error {
		Error::Config {
			file: self.file.to_string(),
			line: self.line,
			col: self.col,
			msg: msg.into(),
		}
	}

	fn skip_spaces(&mut self) {
		loop {
			if let Some(rest) = self.rest.strip_prefix(' ') {
				self.rest = rest;
				self.col += 1;
			} else if let Some(rest) = self.rest.strip_prefix('\t') {
				self.rest = rest;
				self.col += 9 - (self.col % 8);
			} else {
				break;
			}
		}
	}

	fn skip_bytes(&mut self, n: usize) {
		self.rest = &self.rest[n..];
		self.col += n;
	}

	/// Consumes `word` if the line continues with it.
	fn check_str(&mut self, word: &str) -> bool {
		if let Some(rest) = self.rest.strip_prefix(word) {
			self.rest = rest;
			self.col += word.len();
			true
		} else {
			false
		}
	}

	fn get_long(&mut self) -> Result<i64> {
		self.skip_spaces();

		let (digits, radix) = {
			let negative = self.rest.starts_with('-');
			let body = if negative || self.rest.starts_with('+') {
				&self.rest[1..]
			} else {
				self.rest
			};

			if body.starts_with("0x") || body.starts_with("0X") {
				(2 + body[2..].chars().take_while(char::is_ascii_hexdigit).count(), 16)
			} else {
				(body.chars().take_while(char::is_ascii_digit).count(), 10)
			}
		};

		let sign = usize::from(self.rest.starts_with('-') || self.rest.starts_with('+'));
		let len = sign + digits;
		let token = &self.rest[..len];

		let value = if radix == 16 {
			let hex = token.trim_start_matches(['+', '-']);
			i64::from_str_radix(&hex[2..], 16)
				.map(|v| if token.starts_with('-') { -v } else { v })
		} else {
			token.parse::<i64>()
		};

		match value {
			Ok(v) => {
				self.skip_bytes(len);
				Ok(v)
			}
			Err(_) => Err(self.err("integer expected")),
		}
	}

	fn get_float(&mut self) -> Result<f32> {
		self.skip_spaces();

		let mut len = 0;
		let bytes = self.rest.as_bytes();

		if len < bytes.len() && (bytes[len] == b'+' || bytes[len] == b'-') {
			len += 1;
		}
		while len < bytes.len() && bytes[len].is_ascii_digit() {
			len += 1;
		}
		if len < bytes.len() && bytes[len] == b'.' {
			len += 1;
			while len < bytes.len() && bytes[len].is_ascii_digit() {
				len += 1;
			}
		}
		if len < bytes.len() && (bytes[len] == b'e' || bytes[len] == b'E') {
			let mut exp = len + 1;
			if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
				exp += 1;
			}
			let digits = bytes[exp..].iter().take_while(|b| b.is_ascii_digit()).count();
			if digits > 0 {
				len = exp + digits;
			}
		}

		match self.rest[..len].parse::<f32>() {
			Ok(v) => {
				self.skip_bytes(len);
				Ok(v)
			}
			Err(_) => Err(self.err("floating point expected")),
		}
	}

	fn get_str(&mut self) -> Result<String> {
		self.skip_spaces();

		let len = self
			.rest
			.find([' ', '\t'])
			.unwrap_or(self.rest.len());

		if len == 0 {
			return Err(self.err("string expected"));
		}

		let token = self.rest[..len].to_string();
		self.skip_bytes(len);
		Ok(token)
	}

	fn get_name(&mut self) -> Result<String> {
		let name = self.get_str()?;

		let ok = name
			.chars()
			.next()
			.is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
		if !ok {
			return Err(self.err(format!(
				"name must start with alphabetic character or '_', got '{name}'"
			)));
		}

		Ok(name)
	}

	/// `a` or `a-b`.
	fn get_range(&mut self) -> Result<(i64, i64)> {
		let a = self.get_long()?;

		if self.rest.starts_with('-') {
			self.skip_bytes(1);
			let b = self.get_long()?;
			Ok((a, b))
		} else {
			Ok((a, a))
		}
	}

	fn finish(&mut self) -> Result<()> {
		self.skip_spaces();

		if self.rest.is_empty() {
			Ok(())
		} else {
			Err(self.err(format!(
				"extra junk at the end of the line: '{}'",
				self.rest
			)))
		}
	}
}

fn find_node(sim: &Simulation, name: &str) -> Option<usize> {
	sim.nodes.iter().position(|n| n.name == name)
}

fn find_noise(sim: &Simulation, name: &str) -> Option<usize> {
	sim.noises.iter().position(|n| n.name == name)
}

fn find_sniffer(sim: &Simulation, name: &str) -> Option<usize> {
	sim.sniffers.iter().position(|s| s.name == name)
}

fn load_firmware(path: &str) -> Result<Vec<u8>> {
	let image = fs::read(path).map_err(|source| Error::FirmwareOpen {
		path: path.into(),
		source,
	})?;

	if image.len() > RAM_SIZE {
		return Err(Error::FirmwareTooBig {
			path: path.into(),
			size: image.len(),
			limit: RAM_SIZE,
		});
	}

	Ok(image)
}

fn process_line(sim: &mut Simulation, cursor: &mut Cursor<'_>) -> Result<()> {
	cursor.skip_spaces();

	if cursor.rest.is_empty() || cursor.rest.starts_with('#') {
		return Ok(());
	}

	if cursor.check_str("seed") {
		sim.seed = cursor.get_long()? as u32;
	} else if cursor.check_str("time") {
		sim.end_time = cursor.get_long()? as u64;
	} else if cursor.check_str("scale") {
		sim.scale = cursor.get_float()?;
	} else if cursor.check_str("node") {
		let name = cursor.get_name()?;
		let x = cursor.get_float()? * sim.scale;
		let y = cursor.get_float()? * sim.scale;
		let id = cursor.get_long()? as u32;
		let path = cursor.get_str()?;

		if find_node(sim, &name).is_some() {
			return Err(cursor.err(format!("node '{name}' already exists")));
		}

		let image = load_firmware(&path)?;
		sim.add_node(&name, x, y, id, &image)?;
	} else if cursor.check_str("sniffer") {
		let name = cursor.get_name()?;
		let x = cursor.get_float()? * sim.scale;
		let y = cursor.get_float()? * sim.scale;
		let (freq_a, freq_b) = cursor.get_range()?;
		let sensitivity = cursor.get_float()?;
		let path = cursor.get_str()?;

		if find_sniffer(sim, &name).is_some() {
			return Err(cursor.err(format!("sniffer '{name}' already exists")));
		}

		let uid = sim.sniffers.len();
		let sniffer = Sniffer::create(
			name,
			uid,
			x,
			y,
			freq_a as f32 * MHZ,
			freq_b as f32 * MHZ,
			sensitivity,
			Path::new(&path),
		)?;
		sim.add_sniffer(sniffer);
	} else if cursor.check_str("noise") {
		let name = cursor.get_name()?;
		let x = cursor.get_float()? * sim.scale;
		let y = cursor.get_float()? * sim.scale;
		let (freq_a, freq_b) = cursor.get_range()?;
		let power = cursor.get_float()?;
		let on = cursor.get_long()? as u64;
		let off = cursor.get_long()? as u64;

		if find_noise(sim, &name).is_some() {
			return Err(cursor.err(format!("noise '{name}' already exists")));
		}

		sim.add_noise(&name, x, y, freq_a as f32 * MHZ, freq_b as f32 * MHZ, power, on, off);
	} else if cursor.check_str("loss") {
		let name_a = cursor.get_name()?;
		let name_b = cursor.get_name()?;
		let loss = cursor.get_float()?;

		if let Some(node) = find_node(sim, &name_a) {
			if let Some(other) = find_node(sim, &name_b) {
				sim.nodes[node].trx.loss_trx.insert(other, loss);
				sim.nodes[other].trx.loss_trx.insert(node, loss);
			} else if let Some(noise) = find_noise(sim, &name_b) {
				sim.nodes[node].trx.loss_noise.insert(noise, loss);
			} else {
				return Err(
					cursor.err(format!("'{name_b}' does not name a node or a noise"))
				);
			}
		} else if let Some(sniffer) = find_sniffer(sim, &name_a) {
			if let Some(other) = find_node(sim, &name_b) {
				sim.sniffers[sniffer].loss_trx.insert(other, loss);
			} else {
				return Err(cursor.err(format!("'{name_b}' does not name a node")));
			}
		} else {
			return Err(
				cursor.err(format!("'{name_a}' does not name a node or a sniffer"))
			);
		}
	} else {
		return Err(cursor.err("invalid command"));
	}

	cursor.finish()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse_ok(text: &str) -> Simulation {
		let mut sim = Simulation::new();
		parse(&mut sim, "test.cfg", text).unwrap();
		sim
	}

	fn parse_err(text: &str) -> String {
		let mut sim = Simulation::new();
		parse(&mut sim, "test.cfg", text).unwrap_err().to_string()
	}

	#[test]
	fn defaults_without_commands() {
		let sim = parse_ok("# just a comment\n\n");
		assert_eq!(sim.seed, 123_456);
		assert_eq!(sim.end_time, 1_000_000);
		assert_eq!(sim.scale, 1.0);
	}

	#[test]
	fn seed_time_scale() {
		let sim = parse_ok("seed 42\ntime 2000000\nscale 2.5\n");
		assert_eq!(sim.seed, 42);
		assert_eq!(sim.end_time, 2_000_000);
		assert_eq!(sim.scale, 2.5);
	}

	#[test]
	fn hex_integers_are_accepted() {
		let sim = parse_ok("seed 0x10\n");
		assert_eq!(sim.seed, 16);
	}

	#[test]
	fn unknown_command_reports_position() {
		let msg = parse_err("\nbogus 1 2 3\n");
		assert!(msg.starts_with("test.cfg:2:1: invalid command"), "{msg}");
	}

	#[test]
	fn missing_number_reports_column() {
		let msg = parse_err("seed x\n");
		assert!(msg.contains("integer expected"), "{msg}");
		assert!(msg.starts_with("test.cfg:1:"), "{msg}");
	}

	#[test]
	fn trailing_junk_is_rejected() {
		let msg = parse_err("seed 5 oops\n");
		assert!(msg.contains("extra junk"), "{msg}");
	}

	#[test]
	fn noise_and_loss_between_node_and_noise() {
		let dir = std::env::temp_dir();
		let fw = dir.join("motesim_cfg_fw.bin");
		std::fs::write(&fw, [0u8; 16]).unwrap();

		let text = format!(
			"node a 0 0 1 {fw}\nnoise hum 5 0 2400-2480 -30 0 0\nloss a hum 12.5\n",
			fw = fw.display()
		);
		let sim = parse_ok(&text);

		assert_eq!(sim.nodes.len(), 1);
		assert_eq!(sim.noises.len(), 1);
		assert_eq!(sim.noises[0].freq_a, 2400.0 * MHZ);
		assert_eq!(sim.noises[0].freq_b, 2480.0 * MHZ);
		assert!(sim.noises[0].active);
		assert_eq!(sim.nodes[0].trx.loss_noise.get(&0), Some(&12.5));

		let _ = std::fs::remove_file(fw);
	}

	#[test]
	fn node_loss_is_symmetric() {
		let dir = std::env::temp_dir();
		let fw = dir.join("motesim_cfg_fw2.bin");
		std::fs::write(&fw, [0u8; 16]).unwrap();

		let text = format!(
			"node a 0 0 1 {fw}\nnode b 1 0 2 {fw}\nloss a b 40\n",
			fw = fw.display()
		);
		let sim = parse_ok(&text);
		assert_eq!(sim.nodes[0].trx.loss_trx.get(&1), Some(&40.0));
		assert_eq!(sim.nodes[1].trx.loss_trx.get(&0), Some(&40.0));

		let _ = std::fs::remove_file(fw);
	}

	#[test]
	fn duplicate_node_name_is_rejected() {
		let dir = std::env::temp_dir();
		let fw = dir.join("motesim_cfg_fw3.bin");
		std::fs::write(&fw, [0u8; 16]).unwrap();

		let text = format!("node a 0 0 1 {fw}\nnode a 1 0 2 {fw}\n", fw = fw.display());
		let msg = parse_err(&text);
		assert!(msg.contains("node 'a' already exists"), "{msg}");

		let _ = std::fs::remove_file(fw);
	}

	#[test]
	fn bad_name_is_rejected() {
		let dir = std::env::temp_dir();
		let fw = dir.join("motesim_cfg_fw4.bin");
		std::fs::write(&fw, [0u8; 16]).unwrap();

		let text = format!("node 9lives 0 0 1 {fw}\n", fw = fw.display());
		let msg = parse_err(&text);
		assert!(msg.contains("name must start with"), "{msg}");

		let _ = std::fs::remove_file(fw);
	}

	#[test]
	fn missing_firmware_is_rejected() {
		let msg = parse_err("node a 0 0 1 /nonexistent/fw.bin\n");
		assert!(msg.contains("cannot open firmware file"), "{msg}");
	}

	#[test]
	fn oversized_firmware_is_rejected() {
		let dir = std::env::temp_dir();
		let fw = dir.join("motesim_cfg_fw5.bin");
		std::fs::write(&fw, vec![0u8; RAM_SIZE + 1]).unwrap();

		let text = format!("node a 0 0 1 {fw}\n", fw = fw.display());
		let msg = parse_err(&text);
		assert!(msg.contains("too big"), "{msg}");

		let _ = std::fs::remove_file(fw);
	}

	#[test]
	fn scale_multiplies_positions() {
		let dir = std::env::temp_dir();
		let fw = dir.join("motesim_cfg_fw6.bin");
		std::fs::write(&fw, [0u8; 16]).unwrap();

		let text = format!("scale 3\nnode a 2 5 1 {fw}\n", fw = fw.display());
		let sim = parse_ok(&text);
		assert_eq!(sim.nodes[0].x, 6.0);
		assert_eq!(sim.nodes[0].y, 15.0);

		let _ = std::fs::remove_file(fw);
	}

	#[test]
	fn loss_with_unknown_names_is_rejected() {
		let msg = parse_err("loss a b 10\n");
		assert!(msg.contains("'a' does not name a node or a sniffer"), "{msg}");
	}

	#[test]
	fn seed_applies_after_the_whole_file() {
		let mut a = Simulation::new();
		parse(&mut a, "t", "seed 9\n").unwrap();
		let mut b = Simulation::new();
		b.set_seed(9);
		assert_eq!(a.rand.next(), b.rand.next());
	}
}
