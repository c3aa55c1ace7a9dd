//! Shared configuration and error definitions used across the pool.

pub mod config;
pub mod error;

pub use config::*;
pub use error::*;
