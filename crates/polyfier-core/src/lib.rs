//! polyfier-core: configuration generation for the Polyfier dispatcher.
//!
//! Provides the content-addressed configuration codec, seed sets, boolean
//! permuters, and the profile generator that composes them into jobs.

pub mod codec;
pub mod config;
pub mod error;
pub mod permuter;
pub mod profile;
pub mod seeds;

pub use codec::{ConfigKind, Configuration, hash_str, rehash};
pub use config::{ClientConfig, PolyfierConfig};
pub use error::{CoreError, CoreResult};
pub use permuter::{BooleanPermuter, Permuter, SortMode};
pub use profile::{GeneratorConfig, PermuterConfig, Profile, ProfileGenerator};
pub use seeds::{SeedRange, SeedSet, SeedSetBuilder};
