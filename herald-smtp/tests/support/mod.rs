//! Shared helpers for the SMTP integration tests.

pub mod mock_server;
