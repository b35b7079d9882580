//! Core library for the Clawlets runner.
//!
//! Holds the runner keypair store, the sealed-envelope codec that delivers
//! secrets addressed to that key, and the bounded process executor that runs
//! job commands. Knows nothing about HTTP or the job queue; the runner crate
//! wires these pieces together.

pub mod envelope;
pub mod error;
pub mod exec;
pub mod keypair;
pub mod tail;
