//! Staged host/device transfers for the Volcano compute engine.

pub mod flight;
pub mod stage;

pub use flight::{Direction, Flight, FlightTarget, Transfer};
pub use stage::{Stage, StageConfig, DEFAULT_MMAP_MAX_SIZE, FLUSH_WAIT_MS};
