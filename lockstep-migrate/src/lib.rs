//! Lockstep Migration Library
//!
//! Pieces of the `lockstep-migrate` CLI that do not need a database
//! connection: migration file generation and report rendering.

pub mod generate;
pub mod output;
