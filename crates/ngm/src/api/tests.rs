use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    body::Body,
    http::{Request, header},
};
use http_body_util::BodyExt as _;
use tower::ServiceExt as _;

use crate::{
    api,
    app::App,
    config::{Config, PhpFpmVersion},
    db::Db,
    runner::{CommandError, CommandOutput, CommandRunner, CommandSpec},
    state::AppState,
};

#[derive(Default)]
struct FakeRunner {
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait::async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        spec: CommandSpec,
        _timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        self.calls
            .lock()
            .unwrap()
            .push((spec.program.clone(), spec.args.clone()));

        if spec.program == "openssl" {
            for flag in ["-keyout", "-out"] {
                if let Some(pos) = spec.args.iter().position(|a| a == flag) {
                    let path = Path::new(&spec.args[pos + 1]);
                    fs::create_dir_all(path.parent().unwrap()).unwrap();
                    fs::write(path, b"fake pem\n").unwrap();
                }
            }
        }

        Ok(CommandOutput {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

struct TestCtx {
    _tmp: tempfile::TempDir,
    state: Arc<AppState>,
}

async fn test_ctx() -> TestCtx {
    let tmp = tempfile::TempDir::new().unwrap();
    let p = |s: &str| tmp.path().join(s).to_string_lossy().to_string();

    let mut cfg = Config::default();
    cfg.api.tokens = vec!["t0ken".to_string()];
    cfg.nginx.root = p("nginx");
    cfg.certs.webroot = p("acme");
    cfg.certs.letsencrypt_live = p("letsencrypt/live");
    cfg.phpfpm.default_version = "8.3".to_string();
    cfg.phpfpm.versions.insert(
        "8.3".to_string(),
        PhpFpmVersion {
            pools_dir: p("pool.d"),
            service: "php8.3-fpm".to_string(),
            sock_dir: p("run/php"),
        },
    );
    cfg.hosting.home_root = p("home");
    cfg.validate().unwrap();

    let db = Db::open(Path::new(":memory:")).await.unwrap();
    let app = App::new(cfg, db, Arc::new(FakeRunner::default())).unwrap();
    TestCtx {
        _tmp: tmp,
        state: AppState::new(app),
    }
}

async fn response_json(resp: axum::response::Response) -> serde_json::Value {
    let payload = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&payload).unwrap()
}

fn authed(req: axum::http::request::Builder) -> axum::http::request::Builder {
    req.header(header::AUTHORIZATION, "Bearer t0ken")
}

fn add_site_body(domain: &str) -> String {
    serde_json::json!({
        "user": "alice",
        "domain": domain,
        "mode": "php",
        "phpVersion": "8.3",
        "skipCert": true,
        "applyNow": false,
    })
    .to_string()
}

#[tokio::test]
async fn health_is_open() {
    let ctx = test_ctx().await;
    let app = api::router(ctx.state.clone());

    let resp = app
        .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn sites_require_a_valid_token() {
    let ctx = test_ctx().await;

    let resp = api::router(ctx.state.clone())
        .oneshot(Request::builder().uri("/api/sites").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = api::router(ctx.state.clone())
        .oneshot(
            Request::builder()
                .uri("/api/sites")
                .header(header::AUTHORIZATION, "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn upsert_then_list_sites() {
    let ctx = test_ctx().await;

    let resp = api::router(ctx.state.clone())
        .oneshot(
            authed(Request::builder().method("POST").uri("/api/sites"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(add_site_body("site1.example")))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created = response_json(resp).await;
    assert_eq!(created["site"]["domain"], "site1.example");
    assert_eq!(created["site"]["state"], "PENDING");

    let resp = api::router(ctx.state.clone())
        .oneshot(
            authed(Request::builder().uri("/api/sites"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let listed = response_json(resp).await;
    assert_eq!(listed["sites"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn apply_endpoint_converges_the_site() {
    let ctx = test_ctx().await;

    api::router(ctx.state.clone())
        .oneshot(
            authed(Request::builder().method("POST").uri("/api/sites"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(add_site_body("site1.example")))
                .unwrap(),
        )
        .await
        .unwrap();

    let resp = api::router(ctx.state.clone())
        .oneshot(
            authed(Request::builder().method("POST").uri("/api/apply"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let applied = response_json(resp).await;
    assert_eq!(applied["reloaded"], true);
    assert_eq!(applied["domains"][0]["status"], "ok");

    let resp = api::router(ctx.state.clone())
        .oneshot(
            authed(Request::builder().uri("/api/sites/site1.example"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let site = response_json(resp).await;
    assert_eq!(site["state"], "OK");
    assert!(!site["lastRenderHash"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn disable_endpoint_soft_deletes() {
    let ctx = test_ctx().await;

    api::router(ctx.state.clone())
        .oneshot(
            authed(Request::builder().method("POST").uri("/api/sites"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(add_site_body("site1.example")))
                .unwrap(),
        )
        .await
        .unwrap();

    let resp = api::router(ctx.state.clone())
        .oneshot(
            authed(
                Request::builder()
                    .method("POST")
                    .uri("/api/sites/site1.example/disable"),
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let site = response_json(resp).await;
    assert_eq!(site["enabled"], false);
    assert_eq!(site["state"], "DISABLED");
}

#[tokio::test]
async fn missing_site_is_404() {
    let ctx = test_ctx().await;
    let resp = api::router(ctx.state.clone())
        .oneshot(
            authed(Request::builder().uri("/api/sites/ghost.example"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn cert_info_for_unissued_domain() {
    let ctx = test_ctx().await;
    let resp = api::router(ctx.state.clone())
        .oneshot(
            authed(Request::builder().uri("/api/certs/site1.example"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let info = response_json(resp).await;
    assert_eq!(info["exists"], false);
    assert_eq!(info["daysLeft"], 0);
}
