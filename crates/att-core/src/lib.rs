//! # att-core
//!
//! Core types shared by the Attacheable RS crates:
//! - Record identifier type and the `Identifiable` trait
//! - Field-level validation errors
//! - Application configuration (storage root, external tools, replication, logging)

pub mod config;
pub mod error;
pub mod traits;

pub use config::*;
pub use error::*;
pub use traits::*;
