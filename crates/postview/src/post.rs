use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use suspend_cache::cache_key;
use suspend_cache::caching::{CacheKey, Namespace};

/// The namespace of all post resources.
pub static POSTS: LazyLock<Namespace> = LazyLock::new(|| Namespace::new("post"));

/// A post, as served by the post API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub user_id: i64,
    pub id: i64,
    pub title: String,
    pub body: String,
}

/// The cache key of the post with the given id.
pub fn post_key(id: i64) -> CacheKey {
    cache_key![id, &*POSTS]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_key() {
        assert_eq!(post_key(1), post_key(1));
        assert_ne!(post_key(1), post_key(2));
        assert_ne!(post_key(1), cache_key![1, Namespace::new("post")]);
        assert_eq!(post_key(42).to_string(), "[42, #post]");
    }

    #[test]
    fn test_wire_format() {
        let json = r#"{"userId": 1, "id": 3, "title": "a title", "body": "a body"}"#;
        let post: Post = serde_json::from_str(json).unwrap();
        assert_eq!(post.user_id, 1);
        assert_eq!(post.id, 3);

        insta::assert_snapshot!(
            serde_json::to_string(&post).unwrap(),
            @r#"{"userId":1,"id":3,"title":"a title","body":"a body"}"#
        );
    }
}
