//! mlat-core: Pure estimation + correlation library for Mode S
//! multilateration.
//!
//! No async, no I/O — just algorithms. This crate is the shared core used
//! by `mlat-server` for both the live network pipeline and offline replay:
//! receiver sessions, pair clock Kalman filters, the clock graph, the
//! transmission correlator, the TDOA solver, and the aircraft smoother.

pub mod adsb;
pub mod clock;
pub mod config;
pub mod correlator;
pub mod frame;
pub mod geo;
pub mod graph;
pub mod linalg;
pub mod receiver;
pub mod solver;
pub mod track;
pub mod types;

// Re-export commonly used types at crate root
pub use clock::{PairKey, SyncTracker};
pub use config::MlatParams;
pub use correlator::Correlator;
pub use graph::ClockGraph;
pub use receiver::{Arrival, Receiver, ReceiverState};
pub use solver::{solve, Fix};
pub use track::AircraftTracker;
pub use types::*;
