//! Recovering from resources that failed to load.

use crate::caching::{CacheKey, MisuseError, ResourceCache, ResourceError};
use crate::suspense::{RenderPass, Suspend, Suspense};

/// The output of an [`ErrorBoundary`].
#[derive(Debug)]
pub enum Boundary<V> {
    /// The view rendered successfully.
    Rendered(V),
    /// A resource failed to load. The fallback should be shown instead of the view.
    Failed(ResourceError),
}

impl<V> Boundary<V> {
    pub fn rendered(self) -> Option<V> {
        match self {
            Self::Rendered(output) => Some(output),
            Self::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ResourceError> {
        match self {
            Self::Rendered(_) => None,
            Self::Failed(error) => Some(error),
        }
    }
}

/// Catches resource failures of a view and offers to retry them.
///
/// Once a view failed, the boundary keeps showing the failure without rendering the view again,
/// until it is [`reset`](Self::reset), [`reload`](Self::reload)ed, or its reset key changes.
/// Misuse of the cache is never caught, it always propagates to the caller.
#[derive(Debug)]
pub struct ErrorBoundary<R> {
    reset_key: R,
    failure: Option<ResourceError>,
}

impl<R: PartialEq> ErrorBoundary<R> {
    pub fn new(reset_key: R) -> Self {
        Self {
            reset_key,
            failure: None,
        }
    }

    pub fn failure(&self) -> Option<&ResourceError> {
        self.failure.as_ref()
    }

    /// Updates the reset key. If it changed, a previous failure is forgotten.
    pub fn set_reset_key(&mut self, reset_key: R) {
        if self.reset_key != reset_key {
            self.reset_key = reset_key;
            self.reset();
        }
    }

    /// Forgets a previous failure, so that the next render tries the view again.
    ///
    /// Since the cache replays failures, the view fails again unless the failing key was
    /// cleared in the meantime.
    pub fn reset(&mut self) {
        if let Some(failure) = self.failure.take() {
            tracing::debug!(key = %failure.key(), "error boundary reset");
        }
    }

    /// Clears the failing resource from `cache` and resets the boundary.
    ///
    /// Returns the key that was cleared, if the boundary had failed.
    pub fn reload(&mut self, cache: &ResourceCache) -> Option<CacheKey> {
        let failure = self.failure.take()?;
        let key = failure.key().clone();
        cache.clear(&key);
        tracing::debug!(%key, "reloading failed resource");
        Some(key)
    }

    /// Renders `view` through `suspense`, catching load failures.
    pub async fn render<V, F>(
        &mut self,
        suspense: &Suspense<'_>,
        view: F,
    ) -> Result<Boundary<V>, MisuseError>
    where
        F: FnMut(&RenderPass) -> Result<V, Suspend>,
    {
        if let Some(failure) = &self.failure {
            return Ok(Boundary::Failed(failure.clone()));
        }

        match suspense.render(view).await {
            Ok(output) => Ok(Boundary::Rendered(output)),
            Err(ResourceError::Misuse(error)) => Err(error),
            Err(error) => {
                tracing::debug!(
                    error = &error as &dyn std::error::Error,
                    "error boundary caught a failure"
                );
                self.failure = Some(error.clone());
                Ok(Boundary::Failed(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use suspend_test::{self as test, CallCounter, counting_loader};

    use super::*;
    use crate::caching::{EntryStatus, Namespace};

    #[derive(Debug, thiserror::Error)]
    #[error("status {0}")]
    struct StatusError(u16);

    #[tokio::test]
    async fn test_catches_and_reloads() {
        test::setup();

        let cache = ResourceCache::default();
        let suspense = Suspense::new(&cache);
        let posts = Namespace::new("post");
        let key = cache_key![42, &posts];

        let fail = CallCounter::new();
        let mut boundary = ErrorBoundary::new(42);
        let output = boundary
            .render(&suspense, |pass| {
                let result: Result<u32, StatusError> = Err(StatusError(404));
                cache.suspend(pass, &key, counting_loader(&fail, result))
            })
            .await
            .unwrap();

        let failure = output.failure().unwrap();
        assert_eq!(failure.key(), &key);
        assert_eq!(
            failure.load_error().unwrap().downcast_ref::<StatusError>().unwrap().0,
            404
        );
        assert_eq!(fail.count(), 1);

        // The boundary stays failed without rendering the view again.
        let output = boundary
            .render(&suspense, |_| -> Result<u32, Suspend> { unreachable!() })
            .await
            .unwrap();
        assert!(output.failure().is_some());

        assert_eq!(boundary.reload(&cache), Some(key.clone()));
        assert_eq!(cache.status(&key), None);

        let succeed = CallCounter::new();
        let output = boundary
            .render(&suspense, |pass| {
                cache.suspend(pass, &key, counting_loader(&succeed, Ok::<_, StatusError>(7u32)))
            })
            .await
            .unwrap();
        assert_eq!(output.rendered(), Some(Arc::new(7)));
        assert_eq!(succeed.count(), 1);
        assert_eq!(fail.count(), 1);
    }

    #[tokio::test]
    async fn test_reset_key() {
        test::setup();

        let cache = ResourceCache::default();
        let suspense = Suspense::new(&cache);
        let posts = Namespace::new("post");

        let mut boundary = ErrorBoundary::new(1);
        let output = boundary
            .render(&suspense, |pass| {
                let key = cache_key![1, &posts];
                cache.suspend(pass, &key, || async { Err::<u32, _>(StatusError(500)) })
            })
            .await
            .unwrap();
        assert!(output.failure().is_some());

        boundary.set_reset_key(1);
        assert!(boundary.failure().is_some());

        boundary.set_reset_key(2);
        assert!(boundary.failure().is_none());

        let output = boundary
            .render(&suspense, |pass| {
                let key = cache_key![2, &posts];
                cache.suspend(pass, &key, || async { Ok::<_, StatusError>(2u32) })
            })
            .await
            .unwrap();
        assert_eq!(output.rendered(), Some(Arc::new(2)));

        // Switching back replays the failure from the cache.
        boundary.set_reset_key(1);
        let output = boundary
            .render(&suspense, |pass| {
                let key = cache_key![1, &posts];
                cache.suspend(pass, &key, || async { Ok::<_, StatusError>(1u32) })
            })
            .await
            .unwrap();
        assert!(output.failure().is_some());
        assert_eq!(cache.status(&cache_key![1, &posts]), Some(EntryStatus::Errored));
    }

    #[tokio::test]
    async fn test_misuse_propagates() {
        test::setup();

        let cache = ResourceCache::default();
        let suspense = Suspense::new(&cache);
        let key = cache_key!["shared"];
        cache.hydrate(&key, 1u32);

        let mut boundary = ErrorBoundary::new(());
        let error = boundary
            .render(&suspense, |pass| {
                cache.suspend(pass, &key, || async { Ok::<_, StatusError>(String::new()) })
            })
            .await
            .unwrap_err();

        assert!(matches!(error, MisuseError::TypeMismatch { .. }));
        assert!(boundary.failure().is_none());
    }
}
