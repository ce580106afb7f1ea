//! Core types shared across the cache, router and facade.

pub mod category;
pub mod entry;
pub mod request;

use std::pin::Pin;

use futures_util::Stream;

pub use category::{Category, TaskType};
pub use entry::{CacheEntry, CacheLookup, CacheTier};
pub use request::RoutingRequest;

use crate::Result;

/// Ordered token chunks from a provider.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;
