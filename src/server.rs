/// HTTP routes over the query service
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use log::{debug, error};
use std::path::PathBuf;
use tower_http::services::ServeDir;

use crate::query::QueryService;

/// Routes:
/// - `/dif/{ut}`  gzip JSON of snapshots newer than `ut`
/// - `/list/{year}` gzip JSON of archived dates, `0` for every year
/// - `/arc/{yyyymmdd}` raw archive bytes
///
/// Anything else is served from `web_root` when given.
pub fn router(query: QueryService, web_root: Option<PathBuf>) -> Router {
    let router = Router::new()
        .route("/dif/:ut", get(changes_since))
        .route("/list/:year", get(list_archives))
        .route("/arc/:date", get(fetch_archive))
        .with_state(query);

    match web_root {
        Some(root) => router.fallback_service(ServeDir::new(root)),
        None => router,
    }
}

fn binary(body: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response()
}

async fn changes_since(State(query): State<QueryService>, Path(ut): Path<i64>) -> Response {
    match query.changes_since(ut).await {
        Ok(body) => binary(body),
        Err(e) => {
            error!("dif {} failed: {}", ut, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn list_archives(State(query): State<QueryService>, Path(year): Path<i32>) -> Response {
    let year = (year != 0).then_some(year);
    match query.list_archives(year).await {
        Ok(body) => binary(body),
        Err(e) => {
            error!("list {:?} failed: {}", year, e);
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

async fn fetch_archive(State(query): State<QueryService>, Path(date): Path<u32>) -> Response {
    if date == 0 {
        return StatusCode::NO_CONTENT.into_response();
    }
    match query.fetch_archive(&date.to_string()).await {
        Ok(Some(body)) => binary(body),
        Ok(None) => {
            debug!("No archive for {}", date);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            error!("arc {} failed: {}", date, e);
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceMap, Snapshot};
    use crate::storage::archive::{gunzip, ArchiveStore};
    use crate::storage::SnapshotWindow;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use time::macros::date;
    use tower::ServiceExt;

    fn empty(ts: i64) -> Snapshot {
        Snapshot::new(ts, DeviceMap::new())
    }

    fn app(dir: &tempfile::TempDir) -> Router {
        let archive = ArchiveStore::new(dir.path().to_path_buf());
        archive.store(date!(2023 - 12 - 31), &[empty(1)]).unwrap();
        archive.store(date!(2024 - 10 - 20), &[empty(2)]).unwrap();
        let window = SnapshotWindow::from_snapshots(vec![empty(60), empty(120)], 10);
        router(QueryService::new(window, archive), None)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn changes_are_gzip_json() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get(app(&dir), "/dif/60").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(gunzip(&body).unwrap(), br#"[[120,{}]]"#);
    }

    #[tokio::test]
    async fn year_zero_lists_every_archive() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get(app(&dir), "/list/0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(gunzip(&body).unwrap(), br#"["20231231","20241020"]"#);

        let (_, body) = get(app(&dir), "/list/2024").await;
        assert_eq!(gunzip(&body).unwrap(), br#"["20241020"]"#);
    }

    #[tokio::test]
    async fn archive_fetch_and_no_content_cases() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get(app(&dir), "/arc/20241020").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(gunzip(&body).unwrap(), b"[2,{}]");

        let (status, body) = get(app(&dir), "/arc/0").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());

        let (status, _) = get(app(&dir), "/arc/20241021").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}
