use std::sync::Arc;

use serde::Serialize;
use suspend_cache::boundary::{Boundary, ErrorBoundary};
use suspend_cache::caching::{MisuseError, ResourceCache};
use suspend_cache::hydration::{DehydratedState, NamespaceRegistry};
use suspend_cache::suspense::Suspense;

use crate::client::{FetchError, PostClient};
use crate::post::{POSTS, Post, post_key};

/// The ids preloaded when the user shows interest in navigating.
pub const PRELOAD_IDS: std::ops::RangeInclusive<i64> = -1..=4;

/// What the page shows for a post.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum PostView {
    Loaded {
        #[serde(flatten)]
        post: Arc<Post>,
    },
    Failed {
        id: i64,
        message: String,
        status: Option<u16>,
    },
}

/// A page showing one post at a time.
///
/// The post is read through the resource cache inside an error boundary, so navigating back to a
/// post shows it without fetching again, and a failed post keeps showing its failure until it
/// is reloaded.
#[derive(Debug)]
pub struct PostPage {
    cache: ResourceCache,
    client: PostClient,
    boundary: ErrorBoundary<i64>,
    server_state: Option<DehydratedState>,
    current: Option<i64>,
}

impl PostPage {
    pub fn new(cache: ResourceCache, client: PostClient) -> Self {
        Self {
            cache,
            client,
            boundary: ErrorBoundary::new(0),
            server_state: None,
            current: None,
        }
    }

    /// Uses posts that were already rendered on the server.
    ///
    /// They are injected right before the first render.
    pub fn with_server_state(mut self, state: DehydratedState) -> Self {
        self.server_state = Some(state);
        self
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    fn inject_server_state(&mut self) {
        let Some(state) = self.server_state.take() else {
            return;
        };

        let registry = NamespaceRegistry::new().with(&POSTS);
        let report = state.hydrate_into::<Post>(&self.cache, &registry, &POSTS);
        tracing::info!(
            injected = report.injected,
            skipped = report.skipped,
            invalid = report.invalid,
            "injected server-rendered posts"
        );
    }

    /// Renders the post with the given id.
    pub async fn render(&mut self, id: i64) -> Result<PostView, MisuseError> {
        self.inject_server_state();
        self.boundary.set_reset_key(id);
        self.current = Some(id);

        let key = post_key(id);
        let suspense = Suspense::new(&self.cache).on_fallback(|_| {
            tracing::info!(id, "Loading post...");
        });
        let client = &self.client;
        let cache = &self.cache;

        let output = self
            .boundary
            .render(&suspense, |pass| cache.suspend(pass, &key, || client.fetch(id)))
            .await?;

        Ok(match output {
            Boundary::Rendered(post) => PostView::Loaded { post },
            Boundary::Failed(error) => {
                let cause = error.load_error();
                PostView::Failed {
                    id,
                    message: cause.map_or_else(|| error.to_string(), ToString::to_string),
                    status: cause
                        .and_then(|cause| cause.downcast_ref::<FetchError>())
                        .and_then(FetchError::status),
                }
            }
        })
    }

    /// Warms the cache for posts that are likely to be shown next.
    pub fn preload(&self, ids: impl IntoIterator<Item = i64>) {
        for id in ids {
            self.cache.preload(&post_key(id), || self.client.fetch(id));
        }
    }

    /// Drops the cached post and renders it again.
    pub async fn refetch(&mut self, id: i64) -> Result<PostView, MisuseError> {
        self.cache.clear(&post_key(id));
        self.render(id).await
    }

    /// Clears the failed post and renders it again.
    ///
    /// Returns `None` if nothing was rendered yet.
    pub async fn reload(&mut self) -> Result<Option<PostView>, MisuseError> {
        let Some(id) = self.current else {
            return Ok(None);
        };
        self.boundary.reload(&self.cache);
        self.render(id).await.map(Some)
    }
}
