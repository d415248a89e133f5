/// Builds a [`CacheKey`](crate::caching::CacheKey) from one or more parts.
///
/// Every part is converted with [`Into<KeyPart>`](crate::caching::KeyPart). By convention the
/// last part is the [`Namespace`](crate::caching::Namespace) of the resource:
///
/// ```
/// use suspend_cache::cache_key;
/// use suspend_cache::caching::Namespace;
///
/// let posts = Namespace::new("post");
/// let key = cache_key![42, &posts];
/// assert_eq!(key.to_string(), "[42, #post]");
/// ```
#[macro_export]
macro_rules! cache_key {
    ($first:expr $(, $part:expr)* $(,)?) => {{
        let rest: ::std::vec::Vec<$crate::caching::KeyPart> =
            ::std::vec![$($crate::caching::KeyPart::from($part)),*];
        $crate::caching::CacheKey::from_parts($crate::caching::KeyPart::from($first), rest)
    }};
}
