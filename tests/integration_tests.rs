// tests/integration_tests.rs
//
// End-to-end tests driving the axum router in-process.
// The origin is either a scripted in-memory fetcher or an httpmock server.

use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use image::{DynamicImage, RgbImage};
use pixbox::config::ProxyConfig;
use pixbox::error::{ErrorKind, PixboxError, Result};
use pixbox::fetch::{FetchResult, HttpFetcher, SourceFetcher};
use pixbox::security::{sign_query, AllowList, HostPolicy};
use pixbox::server::{router, AppState};
use pixbox::service::ImageService;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;
use url::Url;

fn png_bytes(width: u32, height: u32) -> Bytes {
    let img = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 200])
    }));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    Bytes::from(buf)
}

/// Scripted origin that records every call.
#[derive(Default)]
struct FakeOrigin {
    body: Bytes,
    headers: HeaderMap,
    delay: Duration,
    fail_status: Option<u16>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl FakeOrigin {
    fn serving(body: Bytes) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SourceFetcher for FakeOrigin {
    async fn fetch(&self, url: &Url) -> Result<FetchResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(status) = self.fail_status {
            return Err(PixboxError::fetch_failed(
                url.to_string(),
                Some(status),
                "scripted failure",
            ));
        }
        Ok(FetchResult {
            bytes: self.body.clone(),
            content_type: Some("image/png".to_string()),
            headers: self.headers.clone(),
        })
    }
}

fn test_config() -> ProxyConfig {
    ProxyConfig {
        bucket_root: Some(Url::parse("http://bucket.test/").unwrap()),
        implicit_base_url: Some(Url::parse("http://origin.test/static/").unwrap()),
        ..ProxyConfig::default()
    }
}

fn app(config: ProxyConfig, origin: Arc<FakeOrigin>) -> Router {
    let service = ImageService::with_fetcher(&config, origin);
    router(AppState::new(service, config))
}

async fn get(app: &Router, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn body_image(response: axum::response::Response) -> DynamicImage {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    image::load_from_memory(&body).unwrap()
}

mod routes {
    use super::*;

    #[tokio::test]
    async fn test_healthz() {
        let app = app(test_config(), Arc::new(FakeOrigin::default()));
        let response = get(&app, "/healthz").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_bucket_route_small_box_crops_exactly() {
        let origin = Arc::new(FakeOrigin::serving(png_bytes(300, 200)));
        let app = app(test_config(), origin.clone());

        // base64("cat.png")
        let response = get(&app, "/a/photos/Y2F0LnBuZw==?mode=crop").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let img = body_image(response).await;
        assert_eq!((img.width(), img.height()), (100, 100));

        let urls = origin.urls.lock().unwrap().clone();
        assert_eq!(urls, vec!["http://bucket.test/photos/product-pictures/cat.png"]);
    }

    #[tokio::test]
    async fn test_fixed_box_ignores_query_dimensions() {
        let origin = Arc::new(FakeOrigin::serving(png_bytes(300, 200)));
        let app = app(test_config(), origin);

        // Default clip mode on a 100 box: 300x200 -> 100x67
        let response = get(&app, "/a/photos/Y2F0LnBuZw==?w=10&h=10").await;
        assert_eq!(response.status(), StatusCode::OK);
        let img = body_image(response).await;
        assert_eq!((img.width(), img.height()), (100, 67));
    }

    #[tokio::test]
    async fn test_large_external_box_never_enlarges_in_clip() {
        let origin = Arc::new(FakeOrigin::serving(png_bytes(300, 200)));
        let app = app(test_config(), origin.clone());

        // base64("http://origin.test/pics/dog.png")
        let response = get(&app, "/d/aHR0cDovL29yaWdpbi50ZXN0L3BpY3MvZG9nLnBuZw==").await;
        assert_eq!(response.status(), StatusCode::OK);
        let img = body_image(response).await;
        assert_eq!((img.width(), img.height()), (300, 200));
        assert_eq!(
            origin.urls.lock().unwrap().as_slice(),
            ["http://origin.test/pics/dog.png"]
        );
    }

    #[tokio::test]
    async fn test_query_route_format_conversion() {
        let origin = Arc::new(FakeOrigin::serving(png_bytes(64, 64)));
        let app = app(test_config(), origin);

        let response = get(&app, "/?url=http://origin.test/a.png&w=32&mode=scale&fmt=webp").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/webp");
        let img = body_image(response).await;
        assert_eq!((img.width(), img.height()), (32, 32));
    }

    #[tokio::test]
    async fn test_relative_url_uses_implicit_base() {
        let origin = Arc::new(FakeOrigin::serving(png_bytes(10, 10)));
        let app = app(test_config(), origin.clone());

        let response = get(&app, "/?url=img/a%20b.png&mode=noop").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            origin.urls.lock().unwrap().as_slice(),
            ["http://origin.test/static/img/a%20b.png"]
        );
    }

    #[tokio::test]
    async fn test_cache_headers() {
        let mut origin = FakeOrigin::serving(png_bytes(10, 10));
        origin
            .headers
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("private, max-age=60"));
        origin.headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        origin.headers.insert(
            header::EXPIRES,
            HeaderValue::from_static("Thu, 22 Oct 2015 07:28:00 GMT"),
        );
        let app = app(test_config(), Arc::new(origin));
        let response = get(&app, "/?url=http://origin.test/a.png&mode=noop").await;
        // Transformed output is immutable per URL, whatever the origin says
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "public, max-age=31536000"
        );
        assert_eq!(response.headers().get_all(header::CACHE_CONTROL).iter().count(), 1);
        assert_eq!(
            response.headers()[header::LAST_MODIFIED],
            "Wed, 21 Oct 2015 07:28:00 GMT"
        );
        assert_eq!(response.headers()[header::EXPIRES], "Thu, 22 Oct 2015 07:28:00 GMT");

        let app = super::app(test_config(), Arc::new(FakeOrigin::serving(png_bytes(10, 10))));
        let response = get(&app, "/?url=http://origin.test/a.png&mode=noop").await;
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "public, max-age=31536000"
        );
    }
}

mod rejections {
    use super::*;

    #[tokio::test]
    async fn test_invalid_mode_rejected_before_fetch() {
        let origin = Arc::new(FakeOrigin::serving(png_bytes(10, 10)));
        let app = app(test_config(), origin.clone());

        let response = get(&app, "/?url=http://origin.test/a.png&w=10&mode=triangle").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        let json = body_json(response).await;
        assert_eq!(json["status_code"], 400);
        assert_eq!(json["error_code"], "PIXBOX_INVALID_OPTION");
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_dimension_and_url() {
        let origin = Arc::new(FakeOrigin::serving(png_bytes(10, 10)));
        let app = app(test_config(), origin.clone());

        let response = get(&app, "/?url=http://origin.test/a.png&mode=crop").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error_code"], "PIXBOX_MISSING_DIMENSION");

        let response = get(&app, "/?w=10").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test]
    async fn test_host_not_allowed() {
        let origin = Arc::new(FakeOrigin::serving(png_bytes(10, 10)));
        let config = ProxyConfig {
            allowed_hosts: vec!["origin.test".to_string()],
            ..test_config()
        };
        let app = app(config, origin.clone());

        // base64("http://evil.test/x.png")
        let response = get(&app, "/c/aHR0cDovL2V2aWwudGVzdC94LnBuZw==").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error_code"], "PIXBOX_HOST_NOT_ALLOWED");
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test]
    async fn test_signature_required_when_key_configured() {
        let origin = Arc::new(FakeOrigin::serving(png_bytes(20, 20)));
        let config = ProxyConfig {
            client_key: Some("s3cret".to_string()),
            ..test_config()
        };
        let app = app(config, origin.clone());

        let unsigned = "url=http://origin.test/a.png&w=10&h=10";
        let response = get(&app, &format!("/?{unsigned}")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error_code"], "PIXBOX_SIGNATURE_ERROR");
        assert_eq!(origin.calls(), 0);

        let signed = sign_query(unsigned, "s3cret").unwrap();
        let response = get(&app, &format!("/?{signed}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(origin.calls(), 1);

        let tampered = signed.replace("w=10", "w=11");
        let response = get(&app, &format!("/?{tampered}")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unsupported_source_is_415() {
        let mut bmp = b"BM".to_vec();
        bmp.extend_from_slice(&[0u8; 64]);
        let app = app(test_config(), Arc::new(FakeOrigin::serving(Bytes::from(bmp))));

        let response = get(&app, "/?url=http://origin.test/a.bmp&w=10").await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(body_json(response).await["error_code"], "PIXBOX_IMAGE_FORMAT");
    }

    #[tokio::test]
    async fn test_upstream_failure_is_502() {
        let origin = FakeOrigin {
            fail_status: Some(404),
            ..FakeOrigin::default()
        };
        let app = app(test_config(), Arc::new(origin));

        let response = get(&app, "/?url=http://origin.test/missing.png&w=10").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["error_code"], "PIXBOX_FETCH_ERROR");
    }

    #[tokio::test]
    async fn test_missing_bucket_root_is_internal() {
        let config = ProxyConfig {
            bucket_root: None,
            ..test_config()
        };
        let app = app(config, Arc::new(FakeOrigin::default()));

        let response = get(&app, "/a/photos/Y2F0LnBuZw==").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "internal server error");
    }

    #[tokio::test]
    async fn test_bad_bucket_name() {
        let app = app(test_config(), Arc::new(FakeOrigin::default()));
        let response = get(&app, "/a/pho.tos/Y2F0LnBuZw==").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

mod fetch_limits {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_slow_origin_times_out() {
        let origin = FakeOrigin {
            body: png_bytes(10, 10),
            delay: Duration::from_secs(60),
            ..FakeOrigin::default()
        };
        let config = ProxyConfig {
            timeout: Duration::from_secs(2),
            ..test_config()
        };
        let app = app(config, Arc::new(origin));

        let response = get(&app, "/?url=http://slow.test/a.png&w=10").await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(body_json(response).await["error_code"], "PIXBOX_FETCH_TIMEOUT");
    }

    #[tokio::test]
    async fn test_concurrent_fetches_are_bounded() {
        let origin = Arc::new(FakeOrigin {
            body: png_bytes(16, 16),
            delay: Duration::from_millis(25),
            ..FakeOrigin::default()
        });
        let config = ProxyConfig {
            max_requests: 2,
            ..test_config()
        };
        let app = app(config, origin.clone());

        let requests = (0..6).map(|i| {
            let app = app.clone();
            async move { get(&app, &format!("/?url=http://origin.test/{i}.png&w=8")).await }
        });
        let responses = futures_util::future::join_all(requests).await;

        assert!(responses.iter().all(|r| r.status() == StatusCode::OK));
        assert_eq!(origin.calls(), 6);
        assert!(origin.peak.load(Ordering::SeqCst) <= 2);
    }
}

mod http_origin {
    use super::*;
    use httpmock::prelude::*;

    fn fetcher_for(hosts: &[&str], validate_cert: bool) -> HttpFetcher {
        let hosts: Arc<dyn HostPolicy> = Arc::new(AllowList::new(hosts));
        HttpFetcher::new(Duration::from_secs(5), validate_cert, hosts).unwrap()
    }

    fn open_fetcher() -> HttpFetcher {
        fetcher_for(&[], true)
    }

    /// URL on a loopback port nothing listens on.
    fn refused_url(path: &str) -> Url {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        Url::parse(&format!("http://127.0.0.1:{port}{path}")).unwrap()
    }

    #[tokio::test]
    async fn test_http_fetcher_forwards_cache_headers() {
        let server = MockServer::start_async().await;
        let png = png_bytes(12, 8);
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/img/a.png");
                then.status(200)
                    .header("content-type", "image/png")
                    .header("cache-control", "max-age=300")
                    .header("set-cookie", "session=1")
                    .body(png.to_vec());
            })
            .await;

        let fetcher = open_fetcher();
        let url = Url::parse(&server.url("/img/a.png")).unwrap();
        let result = fetcher.fetch(&url).await.unwrap();

        mock.assert_async().await;
        assert_eq!(result.bytes, png);
        assert_eq!(result.content_type.as_deref(), Some("image/png"));
        assert_eq!(result.headers[header::CACHE_CONTROL], "max-age=300");
        assert!(result.headers.get("set-cookie").is_none());
    }

    #[tokio::test]
    async fn test_http_fetcher_maps_upstream_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/gone.png");
                then.status(404);
            })
            .await;

        let fetcher = open_fetcher();
        let url = Url::parse(&server.url("/gone.png")).unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fetch);
        assert_eq!(err.upstream_status(), Some(404));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_full_service_against_http_origin() {
        let server = MockServer::start_async().await;
        let png = png_bytes(40, 20);
        server
            .mock_async(|when, then| {
                when.method(GET).path("/photo.png");
                then.status(200).body(png.to_vec());
            })
            .await;

        let config = test_config();
        let service = ImageService::from_config(&config).unwrap();
        let app = router(AppState::new(service, config));

        let uri = format!("/?url={}&w=20&h=20&mode=crop&fmt=jpeg", server.url("/photo.png"));
        let response = get(&app, &uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        let img = body_image(response).await;
        assert_eq!((img.width(), img.height()), (20, 20));
    }

    #[tokio::test]
    async fn test_redirect_to_disallowed_host_is_not_followed() {
        let server = MockServer::start_async().await;
        let port = server.port();
        server
            .mock_async(|when, then| {
                when.method(GET).path("/redir.png");
                then.status(302)
                    .header("location", format!("http://localhost:{port}/internal/secret.png"));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/internal/secret.png");
                then.status(200).body(png_bytes(4, 4).to_vec());
            })
            .await;

        let fetcher = fetcher_for(&["127.0.0.1"], true);
        let url = Url::parse(&format!("http://127.0.0.1:{port}/redir.png")).unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fetch);
        assert_eq!(err.upstream_status(), Some(302));
    }

    #[tokio::test]
    async fn test_redirect_within_allowed_hosts_is_followed() {
        let server = MockServer::start_async().await;
        let port = server.port();
        server
            .mock_async(|when, then| {
                when.method(GET).path("/old.png");
                then.status(301)
                    .header("location", format!("http://127.0.0.1:{port}/new.png"));
            })
            .await;
        let target = server
            .mock_async(|when, then| {
                when.method(GET).path("/new.png");
                then.status(200).body(png_bytes(6, 3).to_vec());
            })
            .await;

        let fetcher = fetcher_for(&["127.0.0.1"], true);
        let url = Url::parse(&format!("http://127.0.0.1:{port}/old.png")).unwrap();
        let result = fetcher.fetch(&url).await.unwrap();
        target.assert_async().await;
        assert_eq!(result.bytes, png_bytes(6, 3));
    }

    #[tokio::test]
    async fn test_service_rejects_redirect_escaping_allow_list() {
        let server = MockServer::start_async().await;
        let port = server.port();
        server
            .mock_async(|when, then| {
                when.method(GET).path("/redir.png");
                then.status(302)
                    .header("location", format!("http://localhost:{port}/internal/secret.png"));
            })
            .await;

        let config = ProxyConfig {
            allowed_hosts: vec!["127.0.0.1".to_string()],
            ..test_config()
        };
        let service = ImageService::from_config(&config).unwrap();
        let app = router(AppState::new(service, config));

        let uri = format!("/?url=http://127.0.0.1:{port}/redir.png&w=4&h=4");
        let response = get(&app, &uri).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["error_code"], "PIXBOX_FETCH_ERROR");
    }

    #[tokio::test]
    async fn test_connection_refused_is_fetch_error() {
        let err = open_fetcher().fetch(&refused_url("/a.png")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fetch);
        assert_eq!(err.status_code(), 502);
        assert_eq!(err.upstream_status(), None);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_connection_refused_through_router_is_502() {
        let config = test_config();
        let service = ImageService::from_config(&config).unwrap();
        let app = router(AppState::new(service, config));

        let uri = format!("/?url={}&w=10", refused_url("/a.png"));
        let response = get(&app, &uri).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(body_json(response).await["error_code"], "PIXBOX_FETCH_ERROR");
    }

    #[tokio::test]
    async fn test_tls_handshake_failure_is_fetch_error() {
        let server = MockServer::start_async().await;
        // Plain HTTP listener spoken to over https
        let url = Url::parse(&format!("https://127.0.0.1:{}/a.png", server.port())).unwrap();
        for validate_cert in [true, false] {
            let fetcher = fetcher_for(&[], validate_cert);
            assert_eq!(fetcher.validates_certs(), validate_cert);
            let err = fetcher.fetch(&url).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Fetch, "validate_cert={validate_cert}");
            assert_eq!(err.upstream_status(), None);
        }
    }
}
