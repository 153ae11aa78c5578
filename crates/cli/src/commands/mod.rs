//! CLI command implementations

pub mod cache;
pub mod dead_letters;
pub mod queue;
pub mod session;
