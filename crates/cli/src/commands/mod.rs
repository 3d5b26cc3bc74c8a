//! CLI command implementations

pub mod models;
pub mod risk;
pub mod switches;
