//! Pausing and resuming render passes on pending resources.
//!
//! A view is a plain function of a [`RenderPass`] that reads resources through
//! [`ResourceCache::suspend`] and propagates the not-ready signal with `?`:
//!
//! ```
//! use std::convert::Infallible;
//!
//! use suspend_cache::caching::{Namespace, ResourceCache};
//! use suspend_cache::cache_key;
//! use suspend_cache::suspense::{RenderPass, Suspend, Suspense};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache = ResourceCache::default();
//! let greetings = Namespace::new("greeting");
//!
//! let view = |pass: &RenderPass| -> Result<String, Suspend> {
//!     let key = cache_key!["world", &greetings];
//!     let name = cache.suspend(pass, &key, || async { Ok::<_, Infallible>("world") })?;
//!     Ok(format!("hello {name}"))
//! };
//!
//! let output = Suspense::new(&cache).render(view).await.unwrap();
//! assert_eq!(output, "hello world");
//! # }
//! ```
//!
//! The [`Suspense`] boundary drives such a view to completion: whenever the view suspends, it
//! waits for the pending computation to settle and then re-invokes the view from the beginning.
//! Views keep no partial state between attempts, so they must be safe to call repeatedly.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use thiserror::Error;

use crate::caching::{
    CacheKey, ComputationChannel, MisuseError, ResourceCache, ResourceError, Settled, StaleWaiter,
};
use crate::utils::futures::CallOnDrop;

/// Identifies a render pass across all of its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(u64);

impl PassId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pass#{}", self.0)
    }
}

/// The context a view is rendered in.
#[derive(Debug, Clone)]
pub struct RenderPass {
    id: PassId,
    attempt: u32,
    pausable: bool,
}

impl RenderPass {
    /// A render pass that can pause until pending resources settle.
    pub fn client() -> Self {
        Self {
            id: PassId::next(),
            attempt: 0,
            pausable: true,
        }
    }

    /// A render pass producing static output ahead of time, which cannot pause.
    ///
    /// Views rendered this way must only read resolved or hydrated resources.
    pub fn server() -> Self {
        Self {
            id: PassId::next(),
            attempt: 0,
            pausable: false,
        }
    }

    pub fn id(&self) -> PassId {
        self.id
    }

    /// How many times this pass was resumed before.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_pausable(&self) -> bool {
        self.pausable
    }

    fn resume(&self) -> Self {
        Self {
            id: self.id,
            attempt: self.attempt + 1,
            pausable: self.pausable,
        }
    }
}

/// Returned by a view that could not finish rendering.
#[derive(Debug, Error)]
pub enum Suspend {
    /// A resource is still loading. The view should be rendered again once it settled.
    #[error("suspended on resource {}", .0.key())]
    Pending(Suspension),
    #[error(transparent)]
    Error(#[from] ResourceError),
}

impl From<MisuseError> for Suspend {
    fn from(error: MisuseError) -> Self {
        Self::Error(error.into())
    }
}

/// A render pass registered as a waiter on a pending resource.
///
/// Dropping a suspension without waiting on it removes the render pass from the waiters.
pub struct Suspension {
    key: CacheKey,
    channel: ComputationChannel,
    deregister: CallOnDrop,
}

impl Suspension {
    pub(crate) fn new(key: CacheKey, channel: ComputationChannel, deregister: CallOnDrop) -> Self {
        Self {
            key,
            channel,
            deregister,
        }
    }

    /// The key of the resource this pass is waiting on.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Waits until the resource this pass is suspended on has settled.
    ///
    /// Returns [`StaleWaiter`] if the resource was cleared while it was pending. In that case,
    /// re-rendering looks up the key afresh instead of observing the orphaned outcome.
    pub async fn wait(self) -> Result<(), StaleWaiter> {
        let Self {
            key,
            channel,
            deregister,
        } = self;

        let settled = channel.await;
        // Settling removed the waiters along with the pending state.
        deregister.disarm();

        match settled {
            Ok(Settled {
                detached: false, ..
            }) => Ok(()),
            _ => Err(StaleWaiter { key }),
        }
    }
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspension")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

type Fallback<'a> = Box<dyn Fn(&CacheKey) + Send + Sync + 'a>;

/// A boundary that renders a view to completion, pausing while resources load.
pub struct Suspense<'a> {
    cache: &'a ResourceCache,
    max_attempts: u32,
    fallback: Option<Fallback<'a>>,
}

impl<'a> Suspense<'a> {
    pub fn new(cache: &'a ResourceCache) -> Self {
        Self {
            cache,
            max_attempts: cache.config().max_render_attempts,
            fallback: None,
        }
    }

    /// Registers a callback invoked every time the view suspends, with the pending key.
    ///
    /// This is where a loading indicator would be shown.
    pub fn on_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&CacheKey) + Send + Sync + 'a,
    {
        self.fallback = Some(Box::new(fallback));
        self
    }

    /// Overrides how many times in a row a view may suspend without making progress.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn cache(&self) -> &'a ResourceCache {
        self.cache
    }

    /// Renders `view` in a pausable pass until it produces output or fails.
    ///
    /// Every time `view` suspends, the fallback is shown and the pass waits for the resource to
    /// settle, after which `view` is invoked again with the same pass and an incremented
    /// attempt.
    ///
    /// Suspending on a key for the first time in this render is progress, no matter how many
    /// resources the view reads one after another. Suspending again on a key that already
    /// settled during this render is not. Views that do so `max_attempts` times in a row are
    /// stopped with [`MisuseError::TooManyAttempts`].
    pub async fn render<V, F>(&self, mut view: F) -> Result<V, ResourceError>
    where
        F: FnMut(&RenderPass) -> Result<V, Suspend>,
    {
        let start = Instant::now();
        let mut pass = RenderPass::client();
        let mut settled = HashSet::new();
        let mut stalls = 0;

        loop {
            let suspension = match view(&pass) {
                Ok(output) => {
                    metric!(timer("suspense.render.duration") = start.elapsed());
                    tracing::trace!(pass = %pass.id(), attempts = pass.attempt() + 1, "render pass completed");
                    return Ok(output);
                }
                Err(Suspend::Error(error)) => return Err(error),
                Err(Suspend::Pending(suspension)) => suspension,
            };

            if settled.contains(suspension.key()) {
                stalls += 1;
            } else {
                stalls = 1;
            }
            if stalls >= self.max_attempts {
                let error = MisuseError::TooManyAttempts {
                    key: suspension.key().clone(),
                    attempts: stalls,
                };
                tracing::error!(error = &error as &dyn std::error::Error, "render pass did not settle");
                return Err(error.into());
            }

            if let Some(fallback) = &self.fallback {
                fallback(suspension.key());
            }

            settled.insert(suspension.key().clone());
            if let Err(stale) = suspension.wait().await {
                tracing::debug!(pass = %pass.id(), "{stale}, rendering again");
            }
            pass = pass.resume();
        }
    }

    /// Renders `view` once in a pass that cannot pause.
    ///
    /// Any resource the view requests must already be resolved or hydrated. Requesting a
    /// missing resource still starts loading it, but fails the render with
    /// [`MisuseError::NotPausable`].
    pub fn render_static<V, F>(&self, view: F) -> Result<V, ResourceError>
    where
        F: FnOnce(&RenderPass) -> Result<V, Suspend>,
    {
        match view(&RenderPass::server()) {
            Ok(output) => Ok(output),
            Err(Suspend::Error(error)) => Err(error),
            Err(Suspend::Pending(suspension)) => Err(MisuseError::NotPausable {
                key: suspension.key().clone(),
            }
            .into()),
        }
    }
}

impl fmt::Debug for Suspense<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspense")
            .field("cache", self.cache)
            .field("max_attempts", &self.max_attempts)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
