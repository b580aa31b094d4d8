//! # quire-server: Composition root for Quire
//!
//! Wires the session broadcaster, the project store and the build queue
//! together and exposes them through the `quire` binary.
//!
//! - [`control`]: project lifecycle and compile requests
//! - [`cli`]: command-line arguments and their mapping onto configs
//! - [`local`]: reading a project from a directory for one-shot compiles

pub mod cli;
pub mod control;
pub mod local;

pub use control::{ControlError, ControlPlane};
