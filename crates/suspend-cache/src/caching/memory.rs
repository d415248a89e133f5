use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::collections::hash_map::{Entry as MapEntry, VacantEntry};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tracing::Instrument;

use crate::config::CacheConfig;
use crate::suspense::{PassId, RenderPass, Suspend, Suspension};
use crate::utils::futures::CallOnDrop;

use super::{CacheKey, LoadError, MisuseError, ResourceError};

/// A type-erased resolved value.
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

/// What a computation hands to everyone waiting on it.
#[derive(Clone, Debug)]
pub(crate) struct Settled {
    pub outcome: Result<Value, LoadError>,
    /// The entry was cleared while this computation was running.
    pub detached: bool,
}

pub(crate) type ComputationChannel = Shared<oneshot::Receiver<Settled>>;

enum EntryState {
    Pending {
        channel: ComputationChannel,
        /// Waiting passes in attach order, with their number of live suspensions.
        waiters: Vec<(PassId, usize)>,
    },
    Resolved(Value),
    Errored(LoadError),
}

struct Entry {
    /// Distinguishes this entry from earlier ones under the same key that were cleared.
    generation: u64,
    type_id: TypeId,
    type_name: &'static str,
    state: EntryState,
}

impl Entry {
    fn check_type<T: 'static>(&self, key: &CacheKey) -> Result<(), MisuseError> {
        if self.type_id == TypeId::of::<T>() {
            Ok(())
        } else {
            Err(MisuseError::TypeMismatch {
                key: key.clone(),
                stored: self.type_name,
                requested: type_name::<T>(),
            })
        }
    }
}

/// The observable lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending { waiters: usize },
    Resolved,
    Errored,
}

struct Inner {
    config: CacheConfig,
    entries: Mutex<HashMap<CacheKey, Entry>>,
    generations: AtomicU64,
    runtime: Option<Handle>,
}

impl Inner {
    /// Moves the entry of the given generation out of `Pending`.
    ///
    /// Returns `false` if that entry no longer exists because it was cleared.
    fn transition(&self, key: &CacheKey, generation: u64, outcome: &Result<Value, LoadError>) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.generation == generation => {
                entry.state = match outcome {
                    Ok(value) => EntryState::Resolved(Arc::clone(value)),
                    Err(error) => EntryState::Errored(error.clone()),
                };
                true
            }
            _ => false,
        }
    }

    fn remove_waiter(&self, key: &CacheKey, generation: u64, pass: PassId) {
        let mut entries = self.entries.lock();
        if let Some(Entry {
            generation: current,
            state: EntryState::Pending { waiters, .. },
            ..
        }) = entries.get_mut(key)
        {
            if *current == generation {
                if let Some(index) = waiters.iter().position(|(waiter, _)| *waiter == pass) {
                    waiters[index].1 -= 1;
                    if waiters[index].1 == 0 {
                        waiters.remove(index);
                    }
                }
            }
        }
    }
}

/// A process-wide store of in-flight and completed asynchronous computations.
///
/// Each [`CacheKey`] maps to at most one entry, which is either pending, resolved or errored.
/// Concurrent requests for a missing key are deduplicated: the loader runs exactly once and
/// everybody else attaches to the pending computation.
///
/// Entries never expire. They are only removed by [`clear`](Self::clear) and
/// [`clear_all`](Self::clear_all).
///
/// The handle is cheap to clone; all clones share the same entries.
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<Inner>,
}

static GLOBAL: LazyLock<ResourceCache> = LazyLock::new(ResourceCache::default);

impl fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .inner
            .entries
            .try_lock()
            .map(|entries| entries.len())
            .unwrap_or_default();
        f.debug_struct("ResourceCache")
            .field("name", &self.inner.config.name)
            .field("entries", &entries)
            .finish()
    }
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ResourceCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a cache that spawns its computations on the given runtime.
    ///
    /// Without an explicit runtime, computations are spawned on the runtime of the caller.
    pub fn with_runtime(config: CacheConfig, runtime: Handle) -> Self {
        Self::build(config, Some(runtime))
    }

    fn build(config: CacheConfig, runtime: Option<Handle>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                entries: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                runtime,
            }),
        }
    }

    /// The process-wide default cache.
    pub fn global() -> &'static ResourceCache {
        &GLOBAL
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn name(&self) -> &str {
        &self.inner.config.name
    }

    fn runtime(&self) -> Option<Handle> {
        self.inner
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
    }

    /// Requests the value for `key` from within a render pass.
    ///
    /// - A resolved entry returns its value right away.
    /// - An errored entry replays the captured failure as [`ResourceError::Load`].
    /// - A pending entry registers `pass` as a waiter and returns [`Suspend::Pending`].
    /// - On a miss, `loader` is invoked exactly once, its future is spawned, and the pass
    ///   suspends on it just like on a pending entry.
    ///
    /// Passes that cannot pause get [`MisuseError::NotPausable`] instead of a suspension. The
    /// computation is still started on a miss.
    pub fn suspend<T, F, Fut, E>(
        &self,
        pass: &RenderPass,
        key: &CacheKey,
        loader: F,
    ) -> Result<Arc<T>, Suspend>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        metric!(counter("resources.access") += 1, "namespace" => key.metrics_tag());

        let mut entries = self.inner.entries.lock();
        let (generation, channel, spawn) = match entries.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.check_type::<T>(key).map_err(ResourceError::from)?;
                match &mut entry.state {
                    EntryState::Resolved(value) => {
                        metric!(counter("resources.memory.hit") += 1, "namespace" => key.metrics_tag());
                        tracing::trace!(%key, "resource resolved");
                        return downcast(key, Arc::clone(value)).map_err(Suspend::from);
                    }
                    EntryState::Errored(error) => {
                        tracing::trace!(%key, "replaying resource failure");
                        return Err(Suspend::Error(ResourceError::Load {
                            key: key.clone(),
                            error: error.clone(),
                        }));
                    }
                    EntryState::Pending { channel, waiters } => {
                        metric!(counter("resources.channel.hit") += 1, "namespace" => key.metrics_tag());
                        if !pass.is_pausable() {
                            return Err(not_pausable(key));
                        }
                        match waiters.iter_mut().find(|(waiter, _)| *waiter == pass.id()) {
                            Some((_, suspensions)) => *suspensions += 1,
                            None => waiters.push((pass.id(), 1)),
                        }
                        (entry.generation, channel.clone(), None)
                    }
                }
            }
            MapEntry::Vacant(vacant) => {
                metric!(counter("resources.channel.miss") += 1, "namespace" => key.metrics_tag());
                let Some(runtime) = self.runtime() else {
                    return Err(Suspend::Error(
                        MisuseError::NoRuntime { key: key.clone() }.into(),
                    ));
                };
                let waiters = if pass.is_pausable() {
                    vec![(pass.id(), 1)]
                } else {
                    vec![]
                };
                let (generation, channel, computation) =
                    self.insert_pending::<T>(vacant, waiters);
                (generation, channel, Some((runtime, computation)))
            }
        };
        drop(entries);

        // The loader runs outside of the lock, so it may use the cache itself.
        if let Some((runtime, computation)) = spawn {
            self.spawn_computation(&runtime, computation, loader());
        }

        if !pass.is_pausable() {
            return Err(not_pausable(key));
        }

        let deregister = {
            let inner = Arc::downgrade(&self.inner);
            let key = key.clone();
            let pass = pass.id();
            CallOnDrop::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.remove_waiter(&key, generation, pass);
                }
            })
        };

        tracing::debug!(%key, pass = %pass.id(), "render pass suspended");
        Err(Suspend::Pending(Suspension::new(
            key.clone(),
            channel,
            deregister,
        )))
    }

    /// Awaits the value for `key` outside of any render pass.
    ///
    /// This shares the deduplication of [`suspend`](Self::suspend): a pending computation is
    /// joined, and on a miss `loader` is started. Unlike a suspended render pass, the caller
    /// observes the outcome of the computation it joined, even if the entry is cleared in the
    /// meantime.
    pub async fn load<T, F, Fut, E>(&self, key: &CacheKey, loader: F) -> Result<Arc<T>, ResourceError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        let channel = {
            let mut entries = self.inner.entries.lock();
            match entries.entry(key.clone()) {
                MapEntry::Occupied(occupied) => {
                    let entry = occupied.get();
                    entry.check_type::<T>(key)?;
                    match &entry.state {
                        EntryState::Resolved(value) => {
                            return downcast(key, Arc::clone(value));
                        }
                        EntryState::Errored(error) => {
                            return Err(ResourceError::Load {
                                key: key.clone(),
                                error: error.clone(),
                            });
                        }
                        EntryState::Pending { channel, .. } => channel.clone(),
                    }
                }
                MapEntry::Vacant(vacant) => {
                    let Some(runtime) = self.runtime() else {
                        return Err(MisuseError::NoRuntime { key: key.clone() }.into());
                    };
                    let (_, channel, computation) = self.insert_pending::<T>(vacant, vec![]);
                    drop(entries);
                    self.spawn_computation(&runtime, computation, loader());
                    channel
                }
            }
        };

        let settled = channel.await.unwrap_or_else(|_canceled| Settled {
            outcome: Err(LoadError::new(anyhow::anyhow!(
                "{} computation channel dropped",
                self.name()
            ))),
            detached: true,
        });
        match settled.outcome {
            Ok(value) => downcast(key, value),
            Err(error) => Err(ResourceError::Load {
                key: key.clone(),
                error,
            }),
        }
    }

    /// Warms the cache for `key` without participating in a render pass.
    ///
    /// If there is no entry for `key`, `loader` is invoked and its future spawned. If there is
    /// an entry in any state, this does nothing: the first caller to populate a key wins.
    pub fn preload<T, F, Fut, E>(&self, key: &CacheKey, loader: F)
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        metric!(counter("resources.preload") += 1, "namespace" => key.metrics_tag());

        let mut entries = self.inner.entries.lock();
        let MapEntry::Vacant(vacant) = entries.entry(key.clone()) else {
            tracing::trace!(%key, "skipping preload of existing resource");
            return;
        };
        let Some(runtime) = self.runtime() else {
            let error = MisuseError::NoRuntime { key: key.clone() };
            tracing::error!(error = &error as &dyn std::error::Error, "failed to preload resource");
            return;
        };
        let (_, _, computation) = self.insert_pending::<T>(vacant, vec![]);
        drop(entries);

        tracing::debug!(%key, "preloading resource");
        self.spawn_computation(&runtime, computation, loader());
    }

    /// Seeds `key` with an already computed value.
    ///
    /// This is the resolved-value path of [`preload`](Self::preload), used to inject data that
    /// was computed out of band, for example during server-side rendering. It never overwrites
    /// an existing entry. Returns whether the value was injected.
    pub fn hydrate<T>(&self, key: &CacheKey, value: T) -> bool
    where
        T: Send + Sync + 'static,
    {
        let mut entries = self.inner.entries.lock();
        let MapEntry::Vacant(vacant) = entries.entry(key.clone()) else {
            tracing::trace!(%key, "skipping hydration of existing resource");
            return false;
        };
        vacant.insert(Entry {
            generation: self.next_generation(),
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            state: EntryState::Resolved(Arc::new(value)),
        });
        drop(entries);

        metric!(counter("resources.hydrate") += 1, "namespace" => key.metrics_tag());
        tracing::debug!(%key, "hydrated resource");
        true
    }

    /// Returns the resolved value for `key` without loading or suspending.
    pub fn peek<T>(&self, key: &CacheKey) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let entries = self.inner.entries.lock();
        let entry = entries.get(key)?;
        match &entry.state {
            EntryState::Resolved(value) => Arc::clone(value).downcast().ok(),
            _ => None,
        }
    }

    /// Removes the entry for `key`, whatever its state.
    ///
    /// A pending computation is not cancelled. Its waiters are still woken once it settles, but
    /// its outcome is not stored, and the next request for `key` starts a fresh computation.
    pub fn clear(&self, key: &CacheKey) {
        let removed = self.inner.entries.lock().remove(key);
        let Some(entry) = removed else {
            return;
        };

        metric!(counter("resources.clear") += 1, "namespace" => key.metrics_tag());
        match entry.state {
            EntryState::Pending { waiters, .. } => {
                tracing::debug!(%key, waiters = waiters.len(), "detached pending resource");
            }
            _ => tracing::debug!(%key, "cleared resource"),
        }
    }

    /// Removes all entries.
    pub fn clear_all(&self) {
        let removed = std::mem::take(&mut *self.inner.entries.lock());
        tracing::debug!(entries = removed.len(), "cleared all resources");
    }

    pub fn status(&self, key: &CacheKey) -> Option<EntryStatus> {
        let entries = self.inner.entries.lock();
        let status = match &entries.get(key)?.state {
            EntryState::Pending { waiters, .. } => EntryStatus::Pending {
                waiters: waiters.len(),
            },
            EntryState::Resolved(_) => EntryStatus::Resolved,
            EntryState::Errored(_) => EntryStatus::Errored,
        };
        Some(status)
    }

    /// The render passes currently waiting on `key`, in the order they attached.
    pub fn waiters(&self, key: &CacheKey) -> Vec<PassId> {
        match self.inner.entries.lock().get(key) {
            Some(Entry {
                state: EntryState::Pending { waiters, .. },
                ..
            }) => waiters.iter().map(|(pass, _)| *pass).collect(),
            _ => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_generation(&self) -> u64 {
        self.inner.generations.fetch_add(1, Ordering::Relaxed)
    }

    fn insert_pending<T: 'static>(
        &self,
        vacant: VacantEntry<'_, CacheKey, Entry>,
        waiters: Vec<(PassId, usize)>,
    ) -> (u64, ComputationChannel, Computation) {
        let generation = self.next_generation();
        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();

        let computation = Computation {
            inner: Arc::downgrade(&self.inner),
            key: vacant.key().clone(),
            generation,
            sender: Some(sender),
        };
        vacant.insert(Entry {
            generation,
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            state: EntryState::Pending {
                channel: channel.clone(),
                waiters,
            },
        });

        (generation, channel, computation)
    }

    /// Spawns the loader's future, settling the entry once it completes.
    ///
    /// NOTE: This is not `async`, because it should eagerly spawn the computation on an
    /// executor, even if nobody ever awaits its result.
    fn spawn_computation<T, Fut, E>(&self, runtime: &Handle, computation: Computation, future: Fut)
    where
        T: Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        let name = self.name().to_owned();
        let span = tracing::debug_span!("resource_computation", key = %computation.key);

        let task = async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(value)) => Ok(Arc::new(value) as Value),
                Ok(Err(error)) => Err(LoadError::new(error)),
                Err(panic) => Err(LoadError::new(anyhow::anyhow!(
                    "loader panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };

            let status = match &outcome {
                Ok(_) => "resolved",
                Err(_) => "errored",
            };
            metric!(
                counter("resources.computation") += 1,
                "status" => status,
                "cache" => &name,
                "namespace" => computation.key.metrics_tag(),
            );
            if let Err(error) = &outcome {
                tracing::debug!(error = %error, "resource failed to load");
            }

            computation.settle(outcome);
        }
        .instrument(span)
        .bind_hub(Hub::new_from_top(Hub::current()));

        runtime.spawn(task);
    }
}

/// The write side of a pending entry.
///
/// Settling transitions the entry (if it was not cleared in the meantime) and then wakes all
/// waiters. Dropping an unsettled computation settles it with an error, so an entry can never
/// stay pending forever.
struct Computation {
    inner: Weak<Inner>,
    key: CacheKey,
    generation: u64,
    sender: Option<oneshot::Sender<Settled>>,
}

impl Computation {
    fn settle(mut self, outcome: Result<Value, LoadError>) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: Result<Value, LoadError>) {
        let Some(sender) = self.sender.take() else {
            return;
        };

        // Transition first, so woken waiters always find the settled entry.
        let stored = match self.inner.upgrade() {
            Some(inner) => inner.transition(&self.key, self.generation, &outcome),
            None => false,
        };
        if !stored {
            tracing::debug!(key = %self.key, "settled a resource that was cleared while pending");
        }

        sender
            .send(Settled {
                outcome,
                detached: !stored,
            })
            .ok();
    }
}

impl Drop for Computation {
    fn drop(&mut self) {
        if self.sender.is_some() {
            let error = anyhow::anyhow!("computation for {} was dropped before completing", self.key);
            self.finish(Err(LoadError::new(error)));
        }
    }
}

fn downcast<T: Send + Sync + 'static>(key: &CacheKey, value: Value) -> Result<Arc<T>, ResourceError> {
    value.downcast().map_err(|_| {
        MisuseError::TypeMismatch {
            key: key.clone(),
            stored: "unknown",
            requested: type_name::<T>(),
        }
        .into()
    })
}

fn not_pausable(key: &CacheKey) -> Suspend {
    let error = MisuseError::NotPausable { key: key.clone() };
    tracing::warn!(error = &error as &dyn std::error::Error, "misused resource cache");
    Suspend::Error(error.into())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
