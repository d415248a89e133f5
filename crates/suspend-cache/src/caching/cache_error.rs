use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::CacheKey;

/// The captured failure of a loader.
///
/// The original error is kept verbatim behind an [`Arc`], so the same failure can be replayed
/// to every waiter and every later [`suspend`](super::ResourceCache::suspend) call.
#[derive(Clone)]
pub struct LoadError(Arc<anyhow::Error>);

impl LoadError {
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(error.into()))
    }

    /// Returns `true` if both errors are the very same captured failure.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Attempts to downcast the original failure to a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref()
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Debug for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// An integration bug between the cache and its caller.
///
/// These are never cached and always surface immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MisuseError {
    /// `suspend` hit a pending resource in a render pass that cannot pause.
    #[error("resource {key} is not ready and the current render pass cannot suspend")]
    NotPausable { key: CacheKey },
    /// The same key was used for values of different types.
    #[error("resource {key} holds a `{stored}`, but a `{requested}` was requested")]
    TypeMismatch {
        key: CacheKey,
        stored: &'static str,
        requested: &'static str,
    },
    /// There is no tokio runtime to drive the loader on.
    #[error("no async runtime available to load resource {key}")]
    NoRuntime { key: CacheKey },
    /// A view kept suspending on resources that already settled, without producing output.
    #[error("render pass gave up after {attempts} attempts waiting for {key}")]
    TooManyAttempts { key: CacheKey, attempts: u32 },
}

/// A failure surfaced to a render pass.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    /// The loader for `key` failed. The failure is replayed until the key is cleared.
    #[error("failed to load resource {key}")]
    Load {
        key: CacheKey,
        #[source]
        error: LoadError,
    },
    #[error(transparent)]
    Misuse(#[from] MisuseError),
}

impl ResourceError {
    /// The key of the resource this error refers to.
    pub fn key(&self) -> &CacheKey {
        match self {
            Self::Load { key, .. } => key,
            Self::Misuse(
                MisuseError::NotPausable { key }
                | MisuseError::TypeMismatch { key, .. }
                | MisuseError::NoRuntime { key }
                | MisuseError::TooManyAttempts { key, .. },
            ) => key,
        }
    }

    /// The captured loader failure, if this is one.
    pub fn load_error(&self) -> Option<&LoadError> {
        match self {
            Self::Load { error, .. } => Some(error),
            Self::Misuse(_) => None,
        }
    }
}

/// A waiter was attached to an entry that got cleared while it was still pending.
///
/// This is not a hard failure: the waiter is still woken once the orphaned computation settles,
/// and re-rendering will look the key up afresh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("resource {key} was cleared while pending")]
pub struct StaleWaiter {
    pub key: CacheKey,
}

#[cfg(test)]
mod tests {
    use crate::caching::Namespace;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("status {0}")]
    struct StatusError(u16);

    #[test]
    fn test_load_error_preserves_source_error() {
        let error = LoadError::new(StatusError(404));
        let replayed = error.clone();

        assert!(error.ptr_eq(&replayed));
        assert!(!error.ptr_eq(&LoadError::new(StatusError(404))));
        assert_eq!(replayed.downcast_ref::<StatusError>().map(|e| e.0), Some(404));
        assert_eq!(replayed.to_string(), "status 404");
    }

    #[test]
    fn test_resource_error_display() {
        let posts = Namespace::new("post");
        let key = cache_key![42, &posts];

        let error = ResourceError::Load {
            key: key.clone(),
            error: LoadError::new(StatusError(404)),
        };
        assert_eq!(error.to_string(), "failed to load resource [42, #post]");
        assert_eq!(error.key(), &key);
        assert!(error.load_error().is_some());

        let error = ResourceError::from(MisuseError::TypeMismatch {
            key: key.clone(),
            stored: "u32",
            requested: "alloc::string::String",
        });
        assert_eq!(
            error.to_string(),
            "resource [42, #post] holds a `u32`, but a `alloc::string::String` was requested"
        );
        assert!(error.load_error().is_none());
    }
}
