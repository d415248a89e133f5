//! The suspending resource cache.
//!
//! [`ResourceCache`] maps [`CacheKey`]s to entries that are either pending, resolved or errored.
//! Entries are created on the first request for a key, either from within a render pass
//! ([`ResourceCache::suspend`]) or ahead of time ([`ResourceCache::preload`] and
//! [`ResourceCache::hydrate`]), and only ever go away through an explicit
//! [`ResourceCache::clear`].
//!
//! Concurrent requests for the same key share one computation. Failures are captured once and
//! replayed to everyone requesting the key until it is cleared; the cache never retries on its
//! own.

mod cache_error;
mod cache_key;
mod memory;

pub use cache_error::*;
pub use cache_key::*;
pub use memory::{EntryStatus, ResourceCache};

pub(crate) use memory::{ComputationChannel, Settled};
