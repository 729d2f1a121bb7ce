//! polyfier-state: durable storage for the Polyfier dispatcher.
//!
//! Backed by [redb](https://docs.rs/redb). Configurations are stored once per
//! content hash in one table per [`ConfigKind`](polyfier_core::ConfigKind);
//! profiles, orders, node history, and results are JSON-serialized into
//! `&[u8]` value columns.
//!
//! The orchestrator only sees the narrow contracts in [`contract`]
//! ([`ConfigStore`], [`ResultStore`], [`NodeStore`]). [`StateStore`] implements
//! all of them and is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).

pub mod contract;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use contract::{ConfigStore, NodeStore, Persistence, ResultStore, store_config, store_profile};
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
