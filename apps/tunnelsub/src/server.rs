use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tunnelsub_core::subscription::{encode_subscription, read_links, validate_sub_path};
use tunnelsub_core::{InstallPaths, InstallationStore};

#[derive(Clone)]
pub struct AppState {
    paths: Arc<InstallPaths>,
}

pub fn router(paths: InstallPaths, sub_path: &str) -> anyhow::Result<Router> {
    let sub_path = validate_sub_path(sub_path)?;
    let state = AppState {
        paths: Arc::new(paths),
    };

    Ok(Router::new()
        .route("/", get(banner))
        .route(&format!("/{sub_path}"), get(subscription_handler))
        .route(&format!("/{sub_path}/"), get(subscription_handler))
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

async fn banner() -> &'static str {
    "Hello world!"
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// Base64 of the current link file, read fresh on every request.
async fn subscription_handler(State(state): State<AppState>) -> Response {
    match read_links(&state.paths) {
        Ok(Some(links)) if !links.is_empty() => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            encode_subscription(&links),
        )
            .into_response(),
        Ok(_) => (StatusCode::SERVICE_UNAVAILABLE, "Subscription not ready").into_response(),
        Err(e) => {
            error!("Failed to read links: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to read subscription").into_response()
        }
    }
}

/// Serves the subscription of the installation at `paths` until killed.
pub async fn serve(paths: InstallPaths) -> anyhow::Result<()> {
    let record = InstallationStore::new(&paths).load()?;
    let port = record.config.subscription_port;
    let app = router(paths, &record.sub_path)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Subscription server listening on {} (/{})", addr, record.sub_path);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use base64::Engine as _;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn app_with_links(contents: Option<&str>) -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstallPaths::new(dir.path());
        if let Some(contents) = contents {
            std::fs::write(paths.links_file(), contents).unwrap();
        }
        let app = router(paths, "sub").unwrap();
        (dir, app)
    }

    #[tokio::test]
    async fn subscription_path_returns_base64_of_links() {
        let (_dir, app) = app_with_links(Some("vmess://abc\nvless://def\n"));
        let (status, body) = get(app, "/sub").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            base64::engine::general_purpose::STANDARD.encode("vmess://abc\nvless://def\n")
        );
    }

    #[tokio::test]
    async fn subscription_path_accepts_trailing_slash() {
        let (_dir, app) = app_with_links(Some("vmess://abc\n"));
        let (status, body) = get(app, "/sub/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, base64::engine::general_purpose::STANDARD.encode("vmess://abc\n"));
    }

    #[tokio::test]
    async fn root_serves_banner() {
        let (_dir, app) = app_with_links(None);
        let (status, body) = get(app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Hello world!");
    }

    #[tokio::test]
    async fn other_paths_are_not_found() {
        let (_dir, app) = app_with_links(Some("vmess://abc\n"));
        assert_eq!(get(app.clone(), "/nope").await.0, StatusCode::NOT_FOUND);
        assert_eq!(get(app, "/sub/extra").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_links_are_unavailable() {
        let (_dir, app) = app_with_links(None);
        assert_eq!(get(app, "/sub").await.0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn invalid_sub_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(router(InstallPaths::new(dir.path()), "a/{b}").is_err());
    }
}
