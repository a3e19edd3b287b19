//! Shared helpers for the delivery integration tests.
#![allow(dead_code)]

#[path = "../../../herald-smtp/tests/support/mock_server.rs"]
pub mod mock_server;
pub mod providers;

use chrono::Utc;
use herald_store::{Job, NewJob};

pub fn job(from: &str, to: &str) -> Job {
    Job::from_new(NewJob::new(to, from, "Hello", "<p>Hi</p>"), Utc::now())
}
