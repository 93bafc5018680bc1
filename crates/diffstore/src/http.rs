//! HTTP serving of raw and diff images.
//!
//! ```text
//! GET {prefix}/images/{digest}.png       raw image, fetched on demand
//! GET {prefix}/diffs/{left}-{right}.png  diff image, regenerated on demand
//! ```
//!
//! Requests map onto the sharded on-disk layout. Anything else is a 404.

use crate::digest::{image_path, strip_extension, validate as validate_digest};
use crate::store::DiffStore;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use diffcache_rtcache::PRIORITY_NOW;
use diffcache_storage::backend::{BlobStore, LocalBlobStore};
use std::path::Path as FsPath;
use tower_http::trace::TraceLayer;

/// Images are named by content, so they never change: cache for 12 hours.
const CACHE_CONTROL: &str = "public, max-age=43200";
const CONTENT_TYPE: &str = "image/png";

impl DiffStore {
    /// Router serving raw images and diff images under `url_prefix`.
    ///
    /// A raw image that isn't on disk yet is fetched at [`PRIORITY_NOW`]
    /// before it is served; a diff image that isn't on disk yet is
    /// regenerated from its two raw images.
    pub fn image_handler(&self, url_prefix: &str) -> Router {
        let routes = Router::new()
            .route("/images/{file}", get(serve_image))
            .route("/diffs/{file}", get(serve_diff))
            .fallback(not_found)
            .with_state(self.clone());
        let prefix = url_prefix.trim_matches('/');
        let router = match prefix.is_empty() {
            true => routes,
            false => Router::new().nest(&format!("/{prefix}"), routes).fallback(not_found),
        };
        router.layer(TraceLayer::new_for_http())
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn serve_image(State(store): State<DiffStore>, Path(file): Path<String>) -> Response {
    let Some(digest) = strip_extension(&file).filter(|digest| validate_digest(digest).is_ok()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !store.loader().is_on_disk(digest)
        && let Err(err) = store.loader().get(PRIORITY_NOW, &[digest]).await
    {
        tracing::warn!(digest, error = ?err, "Unable to retrieve requested image");
        return StatusCode::NOT_FOUND.into_response();
    }
    serve_file(store.loader().local(), &image_path(digest)).await
}

async fn serve_diff(State(store): State<DiffStore>, Path(file): Path<String>) -> Response {
    let Some((left, right)) = strip_extension(&file).and_then(|name| name.split_once('-')) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if validate_digest(left).is_err() || validate_digest(right).is_err() {
        return StatusCode::NOT_FOUND.into_response();
    }
    match store.ensure_diff_image(left, right).await {
        Ok(path) => serve_file(store.diffs(), &path).await,
        Err(err) => {
            tracing::warn!(left, right, error = ?err, "Unable to produce requested diff image");
            StatusCode::NOT_FOUND.into_response()
        },
    }
}

async fn serve_file(store: &LocalBlobStore, path: &FsPath) -> Response {
    match store.read(path).await {
        Ok(bytes) => {
            ([(header::CONTENT_TYPE, CONTENT_TYPE), (header::CACHE_CONTROL, CACHE_CONTROL)], bytes).into_response()
        },
        Err(err) if err.is_not_found() => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            tracing::error!(path = %path.display(), error = ?err, "Unable to read image from disk");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        },
    }
}
