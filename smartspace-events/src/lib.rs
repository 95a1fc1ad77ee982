//! SmartSpace Events - per-scope event log, fanout and streaming.
//!
//! - [`EventStore`]: the sequencer and durable log contract.
//! - [`FanoutBroker`]: lossy-tolerant live channels with trailing windows.
//! - [`EventLog`]: durable-first dual-sink writer.
//! - [`StreamGateway`]: replay plus live-tail subscriptions.

mod broker;
mod gateway;
mod log;
mod retry;
mod store;

pub use broker::{BrokerItem, FanoutBroker};
pub use gateway::{ReplayFrom, StreamGateway, StreamItem, Subscription};
pub use log::EventLog;
pub use retry::with_retry;
pub use store::{EventStore, InMemoryEventStore};
