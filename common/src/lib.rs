//! Core engine for `osync`: synchronize a keyed object namespace from a
//! source store to a destination store, reconciling differences
//! incrementally.
//!
//! The pipeline: listings of both sides ([`listing`]) are filtered
//! ([`filter`]) and merged into per-key decisions ([`produce`]), which a
//! worker pool ([`worker`]) executes through the copy engine ([`copy`]) and
//! verifier ([`verify`]), all under shared rate/concurrency gates. The
//! controller ([`sync`]) wires it together and owns the exit disposition.

pub mod checksum;
pub mod config;
pub mod context;
pub mod copy;
pub mod filter;
pub mod fs;
pub mod listing;
pub mod mem;
pub mod metrics;
pub mod object;
pub mod pool;
pub mod produce;
pub mod progress;
pub mod retry;
pub mod rules;
pub mod store;
pub mod sync;
pub mod verify;
pub mod worker;

pub use config::Config;
pub use context::SyncContext;
pub use object::{Action, FileAttrs, ObjectEntry};
pub use progress::Summary;
pub use rules::{parse_rule_args, Rule};
pub use store::{from_uri, ObjectStore};
pub use sync::{sync, sync_with_context};
