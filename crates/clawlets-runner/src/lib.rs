//! Clawlets runner.
//!
//! Hosts the loopback secrets buffer: a `127.0.0.1`-only HTTP endpoint where
//! a local dashboard hands over job secrets, a TTL store that gives each
//! secret set out at most once, and a pluggable interactive fallback. The
//! `clawlets-runner` binary wires this together with the runner keypair from
//! `clawlets-core`.

pub mod buffer;
pub mod config;
pub mod error;
pub mod hardening;
pub mod prompt;
pub mod routes;
pub mod state;
pub mod store;

pub use buffer::LocalSecretsBuffer;
