//! HTTP handlers.

pub mod admin;
pub mod health;

pub use health::health;
