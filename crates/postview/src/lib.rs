//! Shows posts of a post API, loading them through a suspending resource cache.
//!
//! This is the library part of the `postview` command line tool, exposed so that the page logic
//! can be tested against a local post API.

pub mod client;
pub mod output;
pub mod page;
pub mod post;
