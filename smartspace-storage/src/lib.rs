//! SmartSpace Storage - entity storage trait and backends.
//!
//! - [`EntityStorage`]: runs, tool calls, tool results and the directory.
//! - [`InMemoryStorage`]: lock-guarded maps for tests and development.
//! - [`LmdbStorage`]: one LMDB environment serving both the durable event
//!   log ([`smartspace_events::EventStore`]) and [`EntityStorage`].

mod lmdb;
mod memory;
mod traits;

pub use lmdb::{LmdbError, LmdbStorage};
pub use memory::InMemoryStorage;
pub use traits::{CallTarget, EntityStorage, Transition};
