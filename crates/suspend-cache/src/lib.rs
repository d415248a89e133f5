//! A process-wide cache of asynchronous computations for suspending render passes.
//!
//! The [`caching`] module holds the [`ResourceCache`](caching::ResourceCache) itself,
//! [`suspense`] pauses and resumes render passes on pending resources, [`boundary`] recovers
//! from failed ones, and [`hydration`] moves resolved resources from ahead-of-time rendering into
//! a fresh cache.

#[macro_use]
mod macros;
#[macro_use]
pub mod metrics;

pub mod boundary;
pub mod caching;
pub mod config;
pub mod hydration;
pub mod logging;
pub mod suspense;
mod utils;
