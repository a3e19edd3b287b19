//! Backend storage implementations for the job store
//!
//! - `memory`: in-process storage, for tests and single-node deployments
//!   that can tolerate losing the queue on restart
//! - `mongo`: MongoDB-backed durable storage
//! - `test`: memory storage with change notification and outage injection

pub mod memory;
pub mod mongo;

pub use memory::MemoryJobStore;
pub use mongo::MongoJobStore;
pub use test::TestJobStore;
