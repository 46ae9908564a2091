//! A cycle-accurate discrete-event simulator for fleets of identical 32-bit
//! microcontroller nodes communicating over a shared wireless medium.
//!
//! Every node runs an unmodified firmware image on an interpreted Thumb CPU
//! with a memory-mapped peripheral bus, a software-modeled 802.15.4
//! transceiver, four system timers and an interrupt line. A global
//! microsecond cycle counter advances all nodes in lockstep while the medium
//! models path loss, noise, collisions, CSMA/CA, automatic acknowledgements
//! and link quality between them.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod config;
pub mod cpu;
pub mod error;
pub mod events;
pub mod logging;
pub mod medium;
pub mod noise;
pub mod rand;
pub mod sim;
pub mod sniffer;
pub mod soc;

pub use crate::error::Error;
pub use crate::sim::Simulation;

/// Simulated frequencies are handled in Hz; configuration speaks MHz.
pub const MHZ: f32 = 1_000_000.0;

pub type Result<T> = core::result::Result<T, Error>;
