//! Durable email delivery engine
//!
//! The [`controller::Herald`] configuration ties together a job store, the
//! worker pool with its providers, and the retention sweeper.

pub mod config;
pub mod controller;

pub use controller::Herald;
