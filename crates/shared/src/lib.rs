//! Ledgerd Shared Types and Utilities
//!
//! Row types, enums, and database utilities shared across the ledgerd
//! services.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
