//! Moving resolved resources from ahead-of-time rendering into a fresh cache.
//!
//! On the server, resolved values are collected into a [`DehydratedState`], which is serialized
//! and delivered alongside the initial output. On the client, the state is injected with
//! [`DehydratedState::hydrate_into`] before the first render pass, so that passes requesting those
//! keys resolve immediately instead of loading again.
//!
//! [`Namespace`] tokens have no stable identity across processes, so they are serialized by name
//! and mapped back to the client's tokens with a [`NamespaceRegistry`].

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::caching::{CacheKey, KeyPart, Namespace, ResourceCache};

#[derive(Debug, Error)]
pub enum HydrationError {
    #[error("no namespace registered under the name `{0}`")]
    UnknownNamespace(String),
    #[error("dehydrated key has no parts")]
    EmptyKey,
    #[error("failed to serialize resource {key}")]
    Serialize {
        key: CacheKey,
        #[source]
        source: serde_json::Error,
    },
}

/// A serializable [`KeyPart`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum DehydratedPart {
    Int(i64),
    /// Written as a JSON number, or as `"NaN"`, `"inf"` or `"-inf"` if it is not finite.
    Float(#[serde(with = "float_repr")] f64),
    Str(String),
    Bool(bool),
    Namespace(String),
}

impl PartialEq for DehydratedPart {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            // Same as key parts: all NaNs are equal.
            (Self::Float(a), Self::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Namespace(a), Self::Namespace(b)) => a == b,
            _ => false,
        }
    }
}

mod float_repr {
    use serde::de::{self, Unexpected};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(de::Error::invalid_value(
                    Unexpected::Str(other),
                    &"a number, \"NaN\", \"inf\" or \"-inf\"",
                )),
            },
        }
    }
}

impl From<&KeyPart> for DehydratedPart {
    fn from(part: &KeyPart) -> Self {
        match part {
            KeyPart::Int(value) => Self::Int(*value),
            KeyPart::Float(bits) => Self::Float(f64::from_bits(*bits)),
            KeyPart::Str(value) => Self::Str(value.to_string()),
            KeyPart::Bool(value) => Self::Bool(*value),
            KeyPart::Token(namespace) => Self::Namespace(namespace.name().to_owned()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DehydratedEntry {
    pub key: Vec<DehydratedPart>,
    pub value: serde_json::Value,
}

impl DehydratedEntry {
    fn namespace(&self) -> Option<&str> {
        self.key.iter().find_map(|part| match part {
            DehydratedPart::Namespace(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

/// Maps namespace names to the [`Namespace`] tokens of this process.
#[derive(Debug, Clone, Default)]
pub struct NamespaceRegistry {
    namespaces: HashMap<String, Namespace>,
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a namespace under its name, replacing any namespace of the same name.
    pub fn register(&mut self, namespace: &Namespace) -> Option<Namespace> {
        self.namespaces
            .insert(namespace.name().to_owned(), namespace.clone())
    }

    pub fn with(mut self, namespace: &Namespace) -> Self {
        self.register(namespace);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.get(name)
    }

    /// Rebuilds a cache key from its dehydrated parts.
    pub fn restore(&self, parts: &[DehydratedPart]) -> Result<CacheKey, HydrationError> {
        let parts = parts
            .iter()
            .map(|part| -> Result<KeyPart, HydrationError> {
                Ok(match part {
                    DehydratedPart::Int(value) => KeyPart::Int(*value),
                    DehydratedPart::Float(value) => KeyPart::number(*value),
                    DehydratedPart::Str(value) => KeyPart::from(value.as_str()),
                    DehydratedPart::Bool(value) => KeyPart::Bool(*value),
                    DehydratedPart::Namespace(name) => self
                        .get(name)
                        .cloned()
                        .map(KeyPart::Token)
                        .ok_or_else(|| HydrationError::UnknownNamespace(name.clone()))?,
                })
            })
            .collect::<Result<Vec<_>, HydrationError>>()?;

        CacheKey::try_new(parts).map_err(|_| HydrationError::EmptyKey)
    }
}

/// The outcome of [`DehydratedState::hydrate_into`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HydrationReport {
    /// Entries that were injected into the cache.
    pub injected: usize,
    /// Entries for keys that already had an entry in the cache.
    pub skipped: usize,
    /// Entries that could not be restored or deserialized.
    pub invalid: usize,
}

/// Resolved values of a cache, in a form that can be sent to another process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DehydratedState {
    entries: Vec<DehydratedEntry>,
}

impl DehydratedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects the resolved values of `keys` from `cache`.
    ///
    /// Keys that are not resolved, or hold a value of another type, are left out.
    pub fn from_cache<'k, T, I>(cache: &ResourceCache, keys: I) -> Result<Self, HydrationError>
    where
        T: Serialize + Send + Sync + 'static,
        I: IntoIterator<Item = &'k CacheKey>,
    {
        let mut state = Self::new();
        for key in keys {
            if let Some(value) = cache.peek::<T>(key) {
                state.insert(key, &*value)?;
            }
        }
        Ok(state)
    }

    /// Adds a value under `key`, replacing a previous value for the same key.
    pub fn insert<T: Serialize>(&mut self, key: &CacheKey, value: &T) -> Result<(), HydrationError> {
        let value = serde_json::to_value(value).map_err(|source| HydrationError::Serialize {
            key: key.clone(),
            source,
        })?;
        let key: Vec<DehydratedPart> = key.parts().iter().map(DehydratedPart::from).collect();

        match self.entries.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => entry.value = value,
            None => self.entries.push(DehydratedEntry { key, value }),
        }
        Ok(())
    }

    pub fn entries(&self) -> &[DehydratedEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Injects all entries under `namespace` into `cache` as values of type `T`.
    ///
    /// Entries of other namespaces are ignored. Existing cache entries are never overwritten,
    /// so this must run before the first render pass requests any of these keys.
    pub fn hydrate_into<T>(
        &self,
        cache: &ResourceCache,
        registry: &NamespaceRegistry,
        namespace: &Namespace,
    ) -> HydrationReport
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let mut report = HydrationReport::default();

        for entry in &self.entries {
            if entry.namespace() != Some(namespace.name()) {
                continue;
            }

            let key = match registry.restore(&entry.key) {
                Ok(key) if key.namespace() == Some(namespace) => key,
                Ok(_) => continue,
                Err(error) => {
                    tracing::warn!(error = &error as &dyn std::error::Error, "skipping dehydrated resource");
                    report.invalid += 1;
                    continue;
                }
            };

            let value = match T::deserialize(&entry.value) {
                Ok(value) => value,
                Err(error) => {
                    tracing::warn!(%key, error = &error as &dyn std::error::Error, "invalid dehydrated resource");
                    report.invalid += 1;
                    continue;
                }
            };

            if cache.hydrate(&key, value) {
                report.injected += 1;
            } else {
                report.skipped += 1;
            }
        }

        tracing::debug!(
            namespace = namespace.name(),
            injected = report.injected,
            skipped = report.skipped,
            invalid = report.invalid,
            "hydrated resources",
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::caching::EntryStatus;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Post {
        id: u32,
        title: String,
    }

    fn post(id: u32) -> Post {
        Post {
            id,
            title: format!("post {id}"),
        }
    }

    #[test]
    fn test_serialized_format() {
        let posts = Namespace::new("post");
        let mut state = DehydratedState::new();
        state.insert(&cache_key![1, &posts], &post(1)).unwrap();

        let json = serde_json::to_string(&state).unwrap();
        insta::assert_snapshot!(json, @r#"{"entries":[{"key":[{"type":"int","value":1},{"type":"namespace","value":"post"}],"value":{"id":1,"title":"post 1"}}]}"#);

        let parsed: DehydratedState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_insert_replaces() {
        let posts = Namespace::new("post");
        let key = cache_key![1, &posts];

        let mut state = DehydratedState::new();
        state.insert(&key, &post(1)).unwrap();
        state.insert(&key, &post(2)).unwrap();

        assert_eq!(state.len(), 1);
        assert_eq!(state.entries()[0].value["id"], 2);
    }

    #[test]
    fn test_non_finite_float_keys() {
        let values = Namespace::new("value");
        let keys = [
            cache_key![f64::NAN, &values],
            cache_key![f64::INFINITY, &values],
            cache_key![f64::NEG_INFINITY, &values],
            cache_key![1.5, &values],
        ];

        let mut state = DehydratedState::new();
        for (index, key) in keys.iter().enumerate() {
            state.insert(key, &(index as u32)).unwrap();
        }
        state.insert(&keys[0], &9u32).unwrap();
        assert_eq!(state.len(), 4);

        let json = serde_json::to_string(&state).unwrap();
        insta::assert_snapshot!(json, @r#"{"entries":[{"key":[{"type":"float","value":"NaN"},{"type":"namespace","value":"value"}],"value":9},{"key":[{"type":"float","value":"inf"},{"type":"namespace","value":"value"}],"value":1},{"key":[{"type":"float","value":"-inf"},{"type":"namespace","value":"value"}],"value":2},{"key":[{"type":"float","value":1.5},{"type":"namespace","value":"value"}],"value":3}]}"#);

        let parsed: DehydratedState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);

        let cache = ResourceCache::default();
        let registry = NamespaceRegistry::new().with(&values);
        let report = parsed.hydrate_into::<u32>(&cache, &registry, &values);
        assert_eq!(report.injected, 4);
        assert_eq!(cache.peek::<u32>(&keys[0]), Some(Arc::new(9)));
        assert_eq!(cache.peek::<u32>(&keys[2]), Some(Arc::new(2)));

        let error = serde_json::from_str::<DehydratedPart>(r#"{"type":"float","value":"huge"}"#)
            .unwrap_err();
        assert!(error.to_string().contains("invalid value"), "{error}");
    }

    #[test]
    fn test_hydrate_across_processes() {
        // The server and the client each create their own namespace token.
        let server_posts = Namespace::new("post");
        let mut state = DehydratedState::new();
        state.insert(&cache_key![1, &server_posts], &post(1)).unwrap();
        state.insert(&cache_key![2, &server_posts], &post(2)).unwrap();

        let client_posts = Namespace::new("post");
        let registry = NamespaceRegistry::new().with(&client_posts);
        let cache = ResourceCache::default();

        let report = state.hydrate_into::<Post>(&cache, &registry, &client_posts);
        assert_eq!(
            report,
            HydrationReport {
                injected: 2,
                skipped: 0,
                invalid: 0
            }
        );

        let key = cache_key![1, &client_posts];
        assert_eq!(cache.status(&key), Some(EntryStatus::Resolved));
        assert_eq!(cache.peek::<Post>(&key), Some(Arc::new(post(1))));
        assert!(cache.peek::<Post>(&cache_key![1, &server_posts]).is_none());
    }

    #[test]
    fn test_hydrate_does_not_clobber() {
        let posts = Namespace::new("post");
        let key = cache_key![1, &posts];

        let mut state = DehydratedState::new();
        state.insert(&key, &post(1)).unwrap();

        let cache = ResourceCache::default();
        let existing = Post {
            id: 1,
            title: "fresher".into(),
        };
        assert!(cache.hydrate(&key, existing.clone()));

        let registry = NamespaceRegistry::new().with(&posts);
        let report = state.hydrate_into::<Post>(&cache, &registry, &posts);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.injected, 0);
        assert_eq!(cache.peek::<Post>(&key), Some(Arc::new(existing)));
    }

    #[test]
    fn test_hydrate_invalid_entries() {
        let posts = Namespace::new("post");
        let users = Namespace::new("user");

        let mut state = DehydratedState::new();
        state.insert(&cache_key![1, &posts], &"not a post").unwrap();
        state.insert(&cache_key![2, &posts], &post(2)).unwrap();
        state.insert(&cache_key![1, &users], &"someone").unwrap();

        let cache = ResourceCache::default();
        let report =
            state.hydrate_into::<Post>(&cache, &NamespaceRegistry::new().with(&posts), &posts);
        assert_eq!(
            report,
            HydrationReport {
                injected: 1,
                skipped: 0,
                invalid: 1
            }
        );
        assert_eq!(cache.len(), 1);

        // Without a registered namespace, nothing can be restored.
        let cache = ResourceCache::default();
        let report = state.hydrate_into::<Post>(&cache, &NamespaceRegistry::new(), &posts);
        assert_eq!(report.invalid, 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_restore_errors() {
        let registry = NamespaceRegistry::new();
        assert!(matches!(
            registry.restore(&[]),
            Err(HydrationError::EmptyKey)
        ));
        assert!(matches!(
            registry.restore(&[DehydratedPart::Namespace("post".into())]),
            Err(HydrationError::UnknownNamespace(name)) if name == "post"
        ));

        let key = registry
            .restore(&[DehydratedPart::Float(2.0), DehydratedPart::Str("a".into())])
            .unwrap();
        assert_eq!(key, cache_key![2, "a"]);
    }

    #[test]
    fn test_from_cache() {
        let posts = Namespace::new("post");
        let cache = ResourceCache::default();
        cache.hydrate(&cache_key![1, &posts], post(1));
        cache.hydrate(&cache_key![2, &posts], "wrong type");

        let keys = [
            cache_key![1, &posts],
            cache_key![2, &posts],
            cache_key![3, &posts],
        ];
        let state = DehydratedState::from_cache::<Post, _>(&cache, &keys).unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state.entries()[0].value["title"], "post 1");
    }
}
