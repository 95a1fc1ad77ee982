//! SmartSpace Core - Entity Types
//!
//! Pure data structures shared by every other crate: identifiers, scopes and
//! cursors, events, runs, tool calls, connections, memberships, the error
//! taxonomy and configuration. No I/O happens here.

mod config;
mod connection;
mod error;
mod event;
mod identity;
mod run;
mod scope;
mod space;
mod tool;

pub use config::*;
pub use connection::*;
pub use error::*;
pub use event::*;
pub use identity::*;
pub use run::*;
pub use scope::*;
pub use space::*;
pub use tool::*;
