//! Static preview server for the working directory.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tracing::{debug, info};
use vacwatch_core::env_parse;

pub const CRATE_NAME: &str = "vacwatch-web";

pub const INDEX_FILE: &str = "index.html";

#[derive(Clone)]
pub struct AppState {
    pub root: PathBuf,
}

impl AppState {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/{*path}", get(file_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = env_parse("VACWATCH_WEB_PORT", 8000)?;
    let state = AppState::new(".");
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving working directory at http://localhost:{port}/");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    serve_file(state.root.join(INDEX_FILE)).await
}

async fn file_handler(State(state): State<Arc<AppState>>, AxumPath(path): AxumPath<String>) -> Response {
    match resolve(&state.root, &path) {
        Some(target) => serve_file(target).await,
        None => {
            debug!(path = %path, "rejected path outside the served root");
            not_found()
        }
    }
}

/// Joins a request path onto `root`, refusing anything but plain segments.
fn resolve(root: &Path, request: &str) -> Option<PathBuf> {
    let mut target = root.to_path_buf();
    for component in Path::new(request).components() {
        match component {
            Component::Normal(segment) => target.push(segment),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(target)
}

async fn serve_file(path: PathBuf) -> Response {
    let path = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => path.join(INDEX_FILE),
        Ok(_) => path,
        Err(_) => return not_found(),
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type(&path))], bytes).into_response(),
        Err(_) => not_found(),
    }
}

fn content_type(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() == mime_guess::mime::TEXT {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.essence_str().to_string()
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "404 Not Found").into_response()
}
