//! Helpers for testing the resource cache and its collaborators.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using a [`PostServer`], make sure that the server is held until all requests to
//!    the server have been made. Dropping it shuts the server down. To avoid this, assign it to a
//!    variable: `let server = PostServer::new(..);`.
//!
//!  - A [`Gate`] holds back loaders until it is opened. This makes it possible to observe
//!    resources while they are still pending, without relying on timing.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the crates of this workspace and mutes
///    all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("suspend_cache=trace,postview=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Counts how often something was invoked.
#[derive(Clone, Debug, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a call.
    pub fn tick(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Returns a loader that counts its invocations and immediately yields `result`.
pub fn counting_loader<T>(
    counter: &CallCounter,
    result: T,
) -> impl FnOnce() -> std::future::Ready<T> + use<T>
where
    T: Send + 'static,
{
    let counter = counter.clone();
    move || {
        counter.tick();
        std::future::ready(result)
    }
}

/// Holds back futures until it is opened.
///
/// Once opened, a gate stays open, and all futures created by [`Gate::wait_for`] complete.
#[derive(Clone, Debug)]
pub struct Gate {
    open: Arc<watch::Sender<bool>>,
    calls: CallCounter,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (open, _) = watch::channel(false);
        Self {
            open: Arc::new(open),
            calls: CallCounter::new(),
        }
    }

    /// Counts a call and returns a future that yields `result` once the gate is open.
    pub fn wait_for<T>(&self, result: T) -> impl Future<Output = T> + Send + 'static + use<T>
    where
        T: Send + 'static,
    {
        self.calls.tick();
        let mut open = self.open.subscribe();
        async move {
            // The sender lives as long as any clone of the gate.
            open.wait_for(|open| *open).await.ok();
            result
        }
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// How many futures were created through this gate.
    pub fn calls(&self) -> usize {
        self.calls.count()
    }
}

/// A local HTTP server that is shut down when dropped.
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Serves the given router on an ephemeral port.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router.into_make_service())
                .await
                .unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://{}/{}", self.addr(), path)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A post as served by [`PostServer`].
pub fn fake_post(id: i64) -> Value {
    json!({
        "userId": 1,
        "id": id,
        "title": format!("post number {id}"),
        "body": format!("the body of post {id}"),
    })
}

#[derive(Default)]
struct PostState {
    posts: BTreeMap<String, Value>,
    hits: Mutex<BTreeMap<String, usize>>,
    delay: Option<Duration>,
}

/// A fake post API, serving `GET /posts/{id}` and counting requests per id.
///
/// Unknown ids respond with `404 Not Found` and an empty JSON object.
pub struct PostServer {
    server: Server,
    state: Arc<PostState>,
}

impl PostServer {
    /// Serves [`fake_post`]s for the given ids.
    pub fn new(ids: impl IntoIterator<Item = i64>) -> Self {
        Self::build(ids, None)
    }

    /// Like [`new`](Self::new), but every response is delayed.
    pub fn with_delay(ids: impl IntoIterator<Item = i64>, delay: Duration) -> Self {
        Self::build(ids, Some(delay))
    }

    fn build(ids: impl IntoIterator<Item = i64>, delay: Option<Duration>) -> Self {
        let posts = ids
            .into_iter()
            .map(|id| (id.to_string(), fake_post(id)))
            .collect();
        let state = Arc::new(PostState {
            posts,
            hits: Mutex::default(),
            delay,
        });

        let router = Router::new()
            .route("/posts/:id", get(get_post))
            .with_state(state.clone());

        Self {
            server: Server::with_router(router),
            state,
        }
    }

    /// The base URL of the API, without a trailing slash.
    pub fn base_url(&self) -> String {
        self.server.url("").trim_end_matches('/').to_owned()
    }

    /// How often the given post was requested.
    pub fn hits(&self, id: i64) -> usize {
        self.state
            .hits
            .lock()
            .get(&id.to_string())
            .copied()
            .unwrap_or_default()
    }

    /// All requests so far, by id.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let hits = self.state.hits.lock();
        hits.iter().map(|(id, count)| (id.clone(), *count)).collect()
    }

    pub fn total_hits(&self) -> usize {
        self.state.hits.lock().values().sum()
    }
}

async fn get_post(State(state): State<Arc<PostState>>, Path(id): Path<String>) -> Response {
    *state.hits.lock().entry(id.clone()).or_default() += 1;

    if let Some(delay) = state.delay {
        tokio::time::sleep(delay).await;
    }

    match state.posts.get(&id) {
        Some(post) => Json(post.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({}))).into_response(),
    }
}
