//! # Arcana Queue CLI
//!
//! Command-line front end for the Arcana job queue: worker loops, the `exec`
//! re-entry used by isolated worker processes, and queue administration.

pub mod cli;
pub mod commands;
pub mod jobs;
pub mod startup;
