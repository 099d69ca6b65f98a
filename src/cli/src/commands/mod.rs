//! CLI subcommands.

pub mod config;
pub mod health;
pub mod invoke;
pub mod schedule;
