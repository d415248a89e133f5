use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::post::Post;

/// The public post API used when no other one is configured.
pub const DEFAULT_BASE_URL: &str = "https://jsonplaceholder.typicode.com";

#[derive(Debug, Error)]
pub enum FetchError {
    /// The API responded, but not successfully.
    #[error("request failed with status {0}")]
    Status(u16),
    #[error("failed to fetch post")]
    Request(#[from] reqwest::Error),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status(status) => Some(*status),
            Self::Request(error) => error.status().map(|status| status.as_u16()),
        }
    }
}

/// Fetches posts from a post API.
#[derive(Clone, Debug)]
pub struct PostClient {
    http: reqwest::Client,
    base_url: String,
}

impl PostClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("postview/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetches the post with the given id.
    ///
    /// The returned future does not borrow the client, so it can be used as a resource loader.
    pub fn fetch(&self, id: i64) -> impl Future<Output = Result<Post, FetchError>> + Send + 'static + use<> {
        let request = self.http.get(format!("{}/posts/{id}", self.base_url));

        async move {
            tracing::debug!(id, "fetching post");
            let response = request.send().await?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }

            Ok(response.json().await?)
        }
    }
}
