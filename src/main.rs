use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;

use motesim::sim::SHUTDOWN;
use motesim::{config, logging};

#[derive(Parser)]
#[command(version, about = "Cycle-accurate simulator for 802.15.4 microcontroller networks")]
struct Cli {
	/// Simulation configuration file
	config: PathBuf,
}

extern "C" fn on_sigint(_signum: libc::c_int) {
	SHUTDOWN.store(true, Ordering::Relaxed);
}

fn main() -> Result<()> {
	logging::init();

	let cli = Cli::parse();
	let mut sim = config::load(&cli.config)?;

	unsafe {
		libc::signal(libc::SIGINT, on_sigint as extern "C" fn(libc::c_int) as usize);
	}

	let start = Instant::now();
	sim.run()?;

	let millis = start.elapsed().as_millis().max(1) as u64;
	println!(
		"{} cycles in {} ms => {} cycles/sec",
		sim.cycle,
		millis,
		sim.cycle * 1000 / millis
	);

	Ok(())
}
