//! Storage provider sealing pipeline.
//!
//! Drives sectors from packing through pre-commit, seed wait and commit until they are proven,
//! checkpointing every transition so a restarted provider picks up where it left off.

pub mod chain;
pub mod chain_events;
pub mod checks;
pub mod collateral;
pub mod config;
pub mod db;
pub mod fillers;
pub mod message;
pub mod pipeline;
pub mod sealer;
pub mod types;

#[cfg(test)]
mod mock;
