use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get};
use axum::Router;

use crate::handlers::{objects, system};
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Objects
        .route("/api/objects", get(objects::list_objects))
        .route(
            "/api/objects/{*key}",
            get(objects::get_object)
                .put(objects::put_object)
                .delete(objects::delete_object),
        )
        // Cache
        .route("/api/cache/stats", get(system::cache_stats))
        .route("/api/cache", delete(system::clear_cache))
        // Backends
        .route("/api/backends", get(system::list_backends))
        .route("/health", get(system::health))
        // Uploads are streamed to a backend, never buffered.
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use axum::response::Response;
    use tower::ServiceExt; // for `oneshot`

    use cloudpool_backends::backend::directory::DirectoryAdapter;
    use cloudpool_backends::{UnionConfig, UnionCoordinator};
    use cloudpool_cache::{CacheConfig, CacheStore};
    use cloudpool_common::BackendAdapter;

    use crate::quota::Unlimited;
    use crate::streamer::RangeStreamer;

    struct TestApp {
        _backend_dir: tempfile::TempDir,
        _cache_dir: tempfile::TempDir,
        router: Router,
    }

    fn test_app() -> TestApp {
        let backend_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();

        let mut union = UnionCoordinator::new(UnionConfig::default());
        union
            .add_backend(
                Arc::new(DirectoryAdapter::new("local", backend_dir.path())) as Arc<dyn BackendAdapter>,
                0,
            )
            .unwrap();
        let cache = CacheStore::open(CacheConfig {
            root: cache_dir.path().to_path_buf(),
            capacity_bytes: 1 << 20,
            ttl: Duration::from_secs(3600),
        })
        .unwrap();
        let streamer = RangeStreamer::new(Arc::new(union), Arc::new(cache), Arc::new(Unlimited));

        TestApp {
            _backend_dir: backend_dir,
            _cache_dir: cache_dir,
            router: build_router(Arc::new(AppState::new(streamer))),
        }
    }

    async fn send(app: &TestApp, request: Request<Body>) -> Response {
        app.router.clone().oneshot(request).await.unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn put(uri: &str, data: &'static [u8]) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header(header::CONTENT_LENGTH, data.len())
            .header("x-cloudpool-identity", "tester")
            .body(Body::from(data))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_missing_object_is_404_json() {
        let app = test_app();
        let response = send(&app, get("/api/objects/nope.txt")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let app = test_app();
        let response = send(&app, put("/api/objects/docs/hello.txt", b"HELLO")).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["path"], "docs/hello.txt");
        assert_eq!(body["size"], 5);
        assert_eq!(body["backend"], "local");

        let response = send(&app, get("/api/objects/docs/hello.txt")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert_eq!(headers[header::CONTENT_LENGTH], "5");
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(headers["x-cache"], "MISS");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"HELLO");
    }

    #[tokio::test]
    async fn test_range_request_is_partial() {
        let app = test_app();
        send(&app, put("/api/objects/a.bin", b"0123456789")).await;

        let request = Request::builder()
            .uri("/api/objects/a.bin")
            .header(header::RANGE, "bytes=2-5")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "4");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"2345");
    }

    #[tokio::test]
    async fn test_range_past_end_is_416() {
        let app = test_app();
        send(&app, put("/api/objects/a.bin", b"0123456789")).await;

        let request = Request::builder()
            .uri("/api/objects/a.bin")
            .header(header::RANGE, "bytes=10-19")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */10");
    }

    #[tokio::test]
    async fn test_put_without_length_is_411() {
        let app = test_app();
        let request = Request::builder()
            .method("PUT")
            .uri("/api/objects/a.bin")
            .body(Body::from("data"))
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::LENGTH_REQUIRED);
    }

    #[tokio::test]
    async fn test_delete_then_get_is_404() {
        let app = test_app();
        send(&app, put("/api/objects/gone.txt", b"bye")).await;

        let request = Request::builder()
            .method("DELETE")
            .uri("/api/objects/gone.txt")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = send(&app, get("/api/objects/gone.txt")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_objects_by_prefix() {
        let app = test_app();
        send(&app, put("/api/objects/photos/a.jpg", b"a")).await;
        send(&app, put("/api/objects/photos/b.jpg", b"b")).await;
        send(&app, put("/api/objects/notes.txt", b"n")).await;

        let response = send(&app, get("/api/objects?prefix=photos/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let paths: Vec<&str> = body["objects"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["path"].as_str().unwrap())
            .collect();
        assert_eq!(paths, vec!["photos/a.jpg", "photos/b.jpg"]);
    }

    #[tokio::test]
    async fn test_backends_health_and_stats() {
        let app = test_app();

        let response = send(&app, get("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");

        let response = send(&app, get("/api/backends")).await;
        let body = json_body(response).await;
        assert_eq!(body["backends"][0]["name"], "local");

        let response = send(&app, get("/api/cache/stats")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["entries"], 0);
        assert_eq!(body["capacity_bytes"], 1 << 20);

        let request = Request::builder()
            .method("DELETE")
            .uri("/api/cache")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(json_body(response).await["removed"], 0);
    }
}
