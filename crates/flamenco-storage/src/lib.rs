//! Transactional SQLite persistence for the Flamenco Manager core engine.
//!
//! [`Store`] is the sole owner of the connection pool and the process-wide
//! writer lock (§4.1, §5): every mutation goes through
//! [`Store::begin_write`], every multi-row read that needs a consistent
//! snapshot goes through [`Store::begin_read`]. The query modules
//! (`jobs`, `tasks`, `workers`, `failures`, `blocklist`, `scheduling`)
//! expose free functions over a `&mut SqliteConnection` so that the engine
//! crate can compose several of them inside one transaction.

mod blocklist;
mod failures;
mod integrity;
mod jobs;
mod rows;
mod scheduling;
mod store;
mod tasks;
mod workers;

pub use blocklist::*;
pub use failures::*;
pub use integrity::*;
pub use jobs::*;
pub use scheduling::*;
pub use store::{ReadTxn, Store, StoreOptions, WriteTxn};
pub use tasks::*;
pub use workers::*;

pub use flamenco_core::{Error, Result};
