//! Background sweeping of request deadlines

pub mod expiry;

pub use expiry::{ExpirySweeper, SweepReport};
