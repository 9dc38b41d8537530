//! Availability engine: rule and exception stores, slot resolution, and a
//! version-stamped resolution cache.
//!
//! The engine never persists slots. Callers define recurring availability
//! through [`store::RuleStore`], punch holes in it through
//! [`store::ExceptionStore`], and ask [`resolver::SlotResolver`] what is
//! actually bookable right now.

pub mod cache;
pub mod error;
pub mod resolver;
pub mod store;

pub use cache::{CachedResolver, QueryKey, ResolutionCache, SourceVersions};
pub use error::{EngineError, EngineResult};
pub use resolver::{Resolution, SlotResolver};
pub use store::{ExceptionStore, RuleDraft, RuleStore};
