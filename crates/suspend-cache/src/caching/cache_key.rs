use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use thiserror::Error;

/// An opaque identity token used to namespace cache keys.
///
/// Two namespaces are only ever equal if one is a clone of the other. Creating two namespaces
/// with the same name yields two distinct tokens, so unrelated resources that happen to share
/// a numeric id can never collide.
#[derive(Clone)]
pub struct Namespace {
    inner: Arc<NamespaceInner>,
}

struct NamespaceInner {
    name: Box<str>,
}

impl Namespace {
    /// Creates a fresh, unique namespace token.
    ///
    /// The `name` is only used for diagnostics and to find the namespace again when injecting
    /// dehydrated state. It does not take part in equality.
    pub fn new(name: impl Into<Box<str>>) -> Self {
        Self {
            inner: Arc::new(NamespaceInner { name: name.into() }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl PartialEq for Namespace {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Namespace {}

impl Hash for Namespace {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.inner), state);
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({}@{:p})", self.name(), Arc::as_ptr(&self.inner))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.name())
    }
}

/// A single component of a [`CacheKey`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Int(i64),
    /// A non-integral number, stored as its normalized bit pattern.
    Float(u64),
    Str(Arc<str>),
    Bool(bool),
    Token(Namespace),
}

impl KeyPart {
    /// Creates a numeric part.
    ///
    /// Numbers compare by value: floats with an exact integral value become [`KeyPart::Int`],
    /// `-0.0` is treated as `0`, and all NaNs compare equal to each other.
    pub fn number(value: f64) -> Self {
        // `i64::MAX as f64` rounds up to 2^63, which is out of range.
        const LIMIT: f64 = 9_223_372_036_854_775_808.0;
        if value.fract() == 0.0 && (-LIMIT..LIMIT).contains(&value) {
            return Self::Int(value as i64);
        }
        let value = if value.is_nan() { f64::NAN } else { value };
        Self::Float(value.to_bits())
    }

    pub fn as_namespace(&self) -> Option<&Namespace> {
        match self {
            Self::Token(namespace) => Some(namespace),
            _ => None,
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            Self::Str(value) => write!(f, "{value:?}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Token(namespace) => write!(f, "{namespace}"),
        }
    }
}

macro_rules! impl_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for KeyPart {
                fn from(value: $ty) -> Self {
                    Self::Int(value.into())
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f64> for KeyPart {
    fn from(value: f64) -> Self {
        Self::number(value)
    }
}

impl From<f32> for KeyPart {
    fn from(value: f32) -> Self {
        Self::number(value.into())
    }
}

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self::Str(value.into())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self::Str(value.into())
    }
}

impl From<Namespace> for KeyPart {
    fn from(value: Namespace) -> Self {
        Self::Token(value)
    }
}

impl From<&Namespace> for KeyPart {
    fn from(value: &Namespace) -> Self {
        Self::Token(value.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("a cache key needs at least one part")]
    Empty,
}

/// Identifies one resource instance in a [`ResourceCache`](super::ResourceCache).
///
/// A key is an ordered, non-empty sequence of [`KeyPart`]s. Two keys are equal if they have the
/// same length and all parts compare equal; [`Namespace`] parts only compare equal to
/// themselves. Keys are immutable and cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    parts: Arc<[KeyPart]>,
}

impl CacheKey {
    pub fn try_new<I>(parts: I) -> Result<Self, KeyError>
    where
        I: IntoIterator,
        I::Item: Into<KeyPart>,
    {
        let parts: Arc<[KeyPart]> = parts.into_iter().map(Into::into).collect();
        if parts.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self { parts })
    }

    /// Creates a key from a first part and any number of following parts.
    ///
    /// This can not fail, and backs the [`cache_key!`](crate::cache_key) macro.
    pub fn from_parts(first: KeyPart, rest: impl IntoIterator<Item = KeyPart>) -> Self {
        let parts = std::iter::once(first).chain(rest).collect();
        Self { parts }
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Keys are never empty, this exists for API symmetry with [`len`](Self::len).
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Returns the first namespace token in this key, if any.
    pub fn namespace(&self) -> Option<&Namespace> {
        self.parts.iter().find_map(KeyPart::as_namespace)
    }

    /// The namespace name used to tag metrics.
    pub(crate) fn metrics_tag(&self) -> &str {
        self.namespace().map_or("none", Namespace::name)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{part}")?;
        }
        f.write_str("]")
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey{self}")
    }
}
