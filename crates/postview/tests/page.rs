use std::time::Duration;

use postview::client::PostClient;
use postview::output::format_json;
use postview::page::{PRELOAD_IDS, PostPage, PostView};
use postview::post::{Post, post_key};
use suspend_cache::caching::{EntryStatus, ResourceCache};
use suspend_cache::hydration::DehydratedState;
use suspend_test::{self as test, PostServer};

fn page_for(server: &PostServer) -> PostPage {
    let client = PostClient::new(&server.base_url(), Duration::from_secs(5)).unwrap();
    PostPage::new(ResourceCache::default(), client)
}

fn title(view: &PostView) -> &str {
    match view {
        PostView::Loaded { post } => &post.title,
        PostView::Failed { message, .. } => panic!("post failed to load: {message}"),
    }
}

#[tokio::test]
async fn test_render_fetches_once() {
    test::setup();

    let server = PostServer::new([1, 2]);
    let mut page = page_for(&server);

    let view = page.render(1).await.unwrap();
    insta::assert_snapshot!(format_json(&view).unwrap(), @r#"{"state":"loaded","userId":1,"id":1,"title":"post number 1","body":"the body of post 1"}"#);

    assert_eq!(title(&page.render(2).await.unwrap()), "post number 2");
    assert_eq!(title(&page.render(1).await.unwrap()), "post number 1");

    insta::assert_debug_snapshot!(server.all_hits(), @r#"
    [
        (
            "1",
            1,
        ),
        (
            "2",
            1,
        ),
    ]
    "#);
}

#[tokio::test]
async fn test_failure_and_reload() {
    test::setup();

    let server = PostServer::new([1]);
    let mut page = page_for(&server);

    let view = page.render(7).await.unwrap();
    assert_eq!(
        view,
        PostView::Failed {
            id: 7,
            message: "request failed with status 404".into(),
            status: Some(404),
        }
    );

    // Showing the post again replays the failure without a request.
    let again = page.render(7).await.unwrap();
    assert_eq!(again, view);
    assert_eq!(server.hits(7), 1);
    assert_eq!(page.cache().status(&post_key(7)), Some(EntryStatus::Errored));

    let reloaded = page.reload().await.unwrap().unwrap();
    assert_eq!(reloaded, view);
    assert_eq!(server.hits(7), 2);

    // A post that loads fine is unaffected by the failure of another one.
    assert_eq!(title(&page.render(1).await.unwrap()), "post number 1");
}

#[tokio::test]
async fn test_reload_before_render() {
    test::setup();

    let server = PostServer::new([1]);
    let mut page = page_for(&server);

    assert_eq!(page.reload().await.unwrap(), None);
    assert_eq!(server.total_hits(), 0);
}

#[tokio::test]
async fn test_preload() {
    test::setup();

    let server = PostServer::new(0..=4);
    let mut page = page_for(&server);

    page.preload(PRELOAD_IDS);
    for id in 0..=4 {
        assert_eq!(
            title(&page.render(id).await.unwrap()),
            format!("post number {id}")
        );
    }

    let view = page.render(-1).await.unwrap();
    assert!(matches!(view, PostView::Failed { status: Some(404), .. }));

    for id in PRELOAD_IDS {
        assert_eq!(server.hits(id), 1, "post {id} was fetched more than once");
    }

    // Preloading resolved posts again does not fetch them.
    page.preload(PRELOAD_IDS);
    assert_eq!(server.total_hits(), 6);
}

#[tokio::test]
async fn test_refetch() {
    test::setup();

    let server = PostServer::new([1]);
    let mut page = page_for(&server);

    page.render(1).await.unwrap();
    page.render(1).await.unwrap();
    assert_eq!(server.hits(1), 1);

    assert_eq!(title(&page.refetch(1).await.unwrap()), "post number 1");
    assert_eq!(server.hits(1), 2);
}

#[tokio::test]
async fn test_server_state() {
    test::setup();

    let server = PostServer::new([3]);

    let mut state = DehydratedState::new();
    let post = Post {
        user_id: 9,
        id: 3,
        title: "rendered on the server".into(),
        body: "".into(),
    };
    state.insert(&post_key(3), &post).unwrap();

    // The state travels as JSON between processes.
    let state: DehydratedState =
        serde_json::from_str(&serde_json::to_string(&state).unwrap()).unwrap();

    let mut page = page_for(&server).with_server_state(state);
    assert_eq!(title(&page.render(3).await.unwrap()), "rendered on the server");
    assert_eq!(server.total_hits(), 0);

    assert_eq!(title(&page.refetch(3).await.unwrap()), "post number 3");
    assert_eq!(server.hits(3), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pages_share_requests() {
    test::setup();

    let server = PostServer::with_delay([5], Duration::from_millis(100));
    let client = PostClient::new(&server.base_url(), Duration::from_secs(5)).unwrap();
    let cache = ResourceCache::default();

    let mut first = PostPage::new(cache.clone(), client.clone());
    let mut second = PostPage::new(cache, client);

    let (a, b) = tokio::join!(first.render(5), second.render(5));
    assert_eq!(title(&a.unwrap()), "post number 5");
    assert_eq!(title(&b.unwrap()), "post number 5");
    assert_eq!(server.hits(5), 1);
}
