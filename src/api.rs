//! HTTP surface: JSON endpoints under `/api` plus the public `/downloads`
//! tree the ringtone links point into.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::{
    auth::{self, AuthUser},
    builder::{CreateRingtone, PreciseTrim, RingtoneBuilder},
    config::RuntimeConfig,
    ringtones::{RingtoneError, RingtoneLibrary, is_partial_name},
    store::{AudioFormat, RingtoneRecord, RingtoneStore},
    tools::{Downloader, Transcoder, VideoInfo},
    validation::{
        FieldError, MAX_DURATION_SECONDS, MAX_FILE_NAME_CHARS, MIN_DURATION_SECONDS,
        ValidationErrors, validate_url,
    },
};

/// Shared handles for every request. All of them are cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub store: RingtoneStore,
    pub library: RingtoneLibrary,
    pub builder: RingtoneBuilder,
    pub downloader: Downloader,
    pub config: Arc<RuntimeConfig>,
}

impl AppState {
    pub fn new(config: RuntimeConfig, store: RingtoneStore) -> Self {
        let downloader = Downloader::new(
            config.ytdlp_bin.clone(),
            config.info_timeout,
            config.tool_timeout,
        );
        let transcoder = Transcoder::new(config.ffmpeg_bin.clone(), config.tool_timeout);
        let precise_trim = config.precise_trim.then_some(PreciseTrim {
            buffer_secs: config.trim_buffer_secs,
        });
        let builder = RingtoneBuilder::new(
            store.clone(),
            downloader.clone(),
            transcoder,
            config.downloads_root.clone(),
            precise_trim,
        );
        let library = RingtoneLibrary::new(store.clone(), config.downloads_root.clone());

        Self {
            store,
            library,
            builder,
            downloader,
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/anonymous", post(auth::sign_in_anonymous))
        .route("/api/auth/session", get(auth::current_session))
        .route("/api/auth/signout", post(auth::sign_out))
        .route("/api/config", get(client_config))
        .route("/api/video-info", post(video_info))
        .route("/api/ringtones", get(list_ringtones).post(create_ringtone))
        .route(
            "/api/ringtones/{id}",
            patch(update_ringtone).delete(delete_ringtone),
        )
        .route("/downloads/{user_id}/{file}", get(serve_download))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub fields: Vec<FieldError>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            fields: Vec::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Store failures are logged in full and reported without detail.
    pub fn from_store(err: anyhow::Error) -> Self {
        error!(error = %format!("{err:#}"), "store operation failed");
        Self::internal("internal server error")
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: "invalid input".into(),
            fields: errors.fields,
        }
    }
}

impl From<RingtoneError> for ApiError {
    fn from(err: RingtoneError) -> Self {
        match err {
            RingtoneError::Validation(errors) => errors.into(),
            // Already logged with its stage by the builder.
            RingtoneError::Build { .. } => Self::internal(err.to_string()),
            RingtoneError::NotFound => Self::not_found(err.to_string()),
            RingtoneError::Forbidden => Self::forbidden(err.to_string()),
            RingtoneError::Internal(source) => Self::from_store(source),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({ "error": self.message });
        if !self.fields.is_empty() {
            body["fields"] = serde_json::json!(self.fields);
        }
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

async fn not_found() -> ApiError {
    ApiError::not_found("endpoint not found")
}

/// Values the browser needs to mirror server-side validation and to turn
/// relative download URLs into absolute links.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub base_url: String,
    pub min_duration_seconds: f64,
    pub max_duration_seconds: f64,
    pub max_file_name_length: usize,
    pub formats: Vec<&'static str>,
}

async fn client_config(State(state): State<AppState>) -> Json<ClientConfig> {
    Json(ClientConfig {
        base_url: state.config.base_url.clone(),
        min_duration_seconds: MIN_DURATION_SECONDS,
        max_duration_seconds: MAX_DURATION_SECONDS,
        max_file_name_length: MAX_FILE_NAME_CHARS,
        formats: AudioFormat::ALL.iter().map(|format| format.as_str()).collect(),
    })
}

#[derive(Debug, Deserialize)]
pub struct VideoInfoRequest {
    pub url: String,
}

async fn video_info(
    State(state): State<AppState>,
    user: AuthUser,
    payload: Result<Json<VideoInfoRequest>, JsonRejection>,
) -> ApiResult<Json<VideoInfo>> {
    let Json(request) = payload?;
    let url = validate_url(&request.url)?;
    let info = state.downloader.fetch_info(&url).await.map_err(|err| {
        warn!(user_id = %user.user_id, url = %url, error = %err, "video info lookup failed");
        ApiError::bad_request("could not fetch video information")
    })?;
    Ok(Json(info))
}

async fn list_ringtones(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<Vec<RingtoneRecord>>> {
    Ok(Json(state.library.list(&user.user_id).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRingtone {
    pub download_url: String,
}

async fn create_ringtone(
    State(state): State<AppState>,
    user: AuthUser,
    payload: Result<Json<CreateRingtone>, JsonRejection>,
) -> ApiResult<Json<CreatedRingtone>> {
    let Json(request) = payload?;
    let record = state.builder.create(&user.user_id, &request).await?;
    Ok(Json(CreatedRingtone {
        download_url: record.download_url,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRingtone {
    pub file_name: String,
}

async fn update_ringtone(
    State(state): State<AppState>,
    user: AuthUser,
    AxumPath(id): AxumPath<String>,
    payload: Result<Json<RenameRingtone>, JsonRejection>,
) -> ApiResult<Json<RingtoneRecord>> {
    let Json(request) = payload?;
    let record = state
        .library
        .rename(&user.user_id, &id, &request.file_name)
        .await?;
    Ok(Json(record))
}

async fn delete_ringtone(
    State(state): State<AppState>,
    user: AuthUser,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.library.delete(&user.user_id, &id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn serve_download(
    State(state): State<AppState>,
    AxumPath((user_id, file)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    ensure_safe_path_segment(&user_id)?;
    ensure_safe_path_segment(&file)?;
    // Builds in flight are not public yet.
    if is_partial_name(&file) {
        return Err(ApiError::not_found("file not found"));
    }
    let path = state.config.downloads_root.join(&user_id).join(&file);
    stream_file(path, &headers).await
}

/// A dynamic path segment must be a single plain name.
fn ensure_safe_path_segment(value: &str) -> ApiResult<()> {
    let mut components = Path::new(value).components();
    let plain = matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none();
    if value.is_empty() || !plain {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(())
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&value).map_err(|_| ApiError::internal("internal server error"))
}

async fn stream_file(path: PathBuf, headers: &HeaderMap) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }
    let size = metadata.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            response
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let body = Body::from_stream(ReaderStream::new(file.take(length)));
            let mut response = body.into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

/// Single `bytes=` ranges only, including open-ended and suffix forms.
fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let (unit, range) = value.split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    let range = range.trim();
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // "-N" is the last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix_len), size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        // A start past the end still parses so the caller can answer 416.
        size.saturating_sub(1).max(start)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::store::tests::create_store;
    use crate::tools::stubs;
    use axum::{body::to_bytes, http::Request};
    use serde_json::{Value, json};
    use std::time::Duration;
    use tower::ServiceExt;

    struct ApiTestContext {
        _temp: tempfile::TempDir,
        bin: PathBuf,
        state: AppState,
    }

    struct Reply {
        status: StatusCode,
        headers: HeaderMap,
        body: Vec<u8>,
    }

    impl Reply {
        fn json(&self) -> Value {
            serde_json::from_slice(&self.body).unwrap()
        }
    }

    impl ApiTestContext {
        async fn new() -> Self {
            Self::with_ytdlp(|bin| stubs::ytdlp(bin, "audio")).await
        }

        async fn with_ytdlp(make: impl FnOnce(&Path) -> PathBuf) -> Self {
            let (temp, store) = create_store().await.unwrap();
            let bin = temp.path().join("bin");
            std::fs::create_dir_all(&bin).unwrap();
            let config = RuntimeConfig {
                data_root: temp.path().join("db"),
                downloads_root: temp.path().join("downloads"),
                host: "127.0.0.1".into(),
                port: 8080,
                base_url: "http://127.0.0.1:8080".into(),
                ytdlp_bin: make(&bin),
                ffmpeg_bin: stubs::ffmpeg(&bin),
                info_timeout: Duration::from_secs(10),
                tool_timeout: Duration::from_secs(10),
                precise_trim: false,
                trim_buffer_secs: 5.0,
            };
            Self {
                state: AppState::new(config, store),
                bin,
                _temp: temp,
            }
        }

        async fn send(
            &self,
            method: &str,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> Reply {
            let mut request = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
            }
            let request = match body {
                Some(body) => request
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => request.body(Body::empty()).unwrap(),
            };
            let response = router(self.state.clone()).oneshot(request).await.unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            Reply {
                status,
                headers,
                body: body.to_vec(),
            }
        }

        async fn sign_in(&self) -> (String, String) {
            let reply = self.send("POST", "/api/auth/anonymous", None, None).await;
            assert_eq!(reply.status, StatusCode::OK);
            let body = reply.json();
            (
                body["userId"].as_str().unwrap().to_string(),
                body["token"].as_str().unwrap().to_string(),
            )
        }

        async fn create(&self, token: &str, file_name: &str) -> Reply {
            self.send(
                "POST",
                "/api/ringtones",
                Some(token),
                Some(json!({
                    "url": "https://valid.example/watch?v=abc",
                    "startSeconds": 10,
                    "durationSeconds": 30,
                    "fileName": file_name,
                })),
            )
            .await
        }
    }

    #[tokio::test]
    async fn anonymous_sign_in_sets_cookie_and_session_works() {
        let ctx = ApiTestContext::new().await;
        let reply = ctx.send("POST", "/api/auth/anonymous", None, None).await;
        let cookie = reply.headers[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with("ringping_session="));
        assert!(cookie.contains("HttpOnly"));
        let body = reply.json();
        let token = body["token"].as_str().unwrap();

        let session = ctx.send("GET", "/api/auth/session", Some(token), None).await;
        assert_eq!(session.status, StatusCode::OK);
        assert_eq!(session.json()["userId"], body["userId"]);

        let out = ctx.send("POST", "/api/auth/signout", Some(token), None).await;
        assert_eq!(out.json(), json!({ "success": true }));
        let after = ctx.send("GET", "/api/auth/session", Some(token), None).await;
        assert_eq!(after.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn protected_routes_require_session() {
        let ctx = ApiTestContext::new().await;
        let reply = ctx.send("GET", "/api/ringtones", None, None).await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
        assert!(reply.json()["error"].is_string());

        let reply = ctx.send("GET", "/api/ringtones", Some("bogus"), None).await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_list_download_rename_delete() {
        let ctx = ApiTestContext::new().await;
        let (user_id, token) = ctx.sign_in().await;

        let created = ctx.create(&token, "My Clip").await;
        assert_eq!(created.status, StatusCode::OK);
        assert_eq!(
            created.json()["downloadUrl"],
            format!("/downloads/{user_id}/My Clip.mp3")
        );

        let listed = ctx.send("GET", "/api/ringtones", Some(&token), None).await.json();
        let records = listed.as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["startTime"], 10.0);
        assert_eq!(records[0]["endTime"], 40.0);
        assert_eq!(records[0]["fileName"], "My Clip");
        let id = records[0]["id"].as_str().unwrap().to_string();

        let file = ctx
            .send("GET", &format!("/downloads/{user_id}/My%20Clip.mp3"), None, None)
            .await;
        assert_eq!(file.status, StatusCode::OK);
        assert_eq!(file.body, b"audio");
        assert_eq!(file.headers[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(file.headers[header::ACCEPT_RANGES], "bytes");

        let renamed = ctx
            .send(
                "PATCH",
                &format!("/api/ringtones/{id}"),
                Some(&token),
                Some(json!({ "fileName": "Alarm" })),
            )
            .await;
        assert_eq!(renamed.status, StatusCode::OK);
        assert_eq!(
            renamed.json()["downloadUrl"],
            format!("/downloads/{user_id}/Alarm.mp3")
        );
        let moved = ctx
            .send("GET", &format!("/downloads/{user_id}/Alarm.mp3"), None, None)
            .await;
        assert_eq!(moved.status, StatusCode::OK);

        let deleted = ctx
            .send("DELETE", &format!("/api/ringtones/{id}"), Some(&token), None)
            .await;
        assert_eq!(deleted.json(), json!({ "success": true }));
        let gone = ctx
            .send("GET", &format!("/downloads/{user_id}/Alarm.mp3"), None, None)
            .await;
        assert_eq!(gone.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_create_reports_fields_without_running_tools() {
        let ctx = ApiTestContext::new().await;
        let (_, token) = ctx.sign_in().await;

        let reply = ctx
            .send(
                "POST",
                "/api/ringtones",
                Some(&token),
                Some(json!({
                    "url": "https://valid.example/watch?v=abc",
                    "startSeconds": 0,
                    "durationSeconds": 90,
                    "fileName": "bad:name",
                })),
            )
            .await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        let body = reply.json();
        let fields: Vec<&str> = body["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|field| field["field"].as_str().unwrap())
            .collect();
        assert_eq!(fields, ["durationSeconds", "fileName"]);
        assert!(stubs::calls(&ctx.bin).is_empty());
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let ctx = ApiTestContext::new().await;
        let (_, token) = ctx.sign_in().await;
        let reply = ctx
            .send("POST", "/api/ringtones", Some(&token), Some(json!({ "url": 3 })))
            .await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert!(reply.json()["error"].is_string());
    }

    #[tokio::test]
    async fn other_users_cannot_touch_ringtones() {
        let ctx = ApiTestContext::new().await;
        let (_, owner) = ctx.sign_in().await;
        let (_, intruder) = ctx.sign_in().await;
        ctx.create(&owner, "Mine").await;
        let listed = ctx.send("GET", "/api/ringtones", Some(&owner), None).await.json();
        let id = listed[0]["id"].as_str().unwrap().to_string();

        let reply = ctx
            .send("DELETE", &format!("/api/ringtones/{id}"), Some(&intruder), None)
            .await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
        let reply = ctx
            .send(
                "PATCH",
                &format!("/api/ringtones/{id}"),
                Some(&intruder),
                Some(json!({ "fileName": "Stolen" })),
            )
            .await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
        let reply = ctx
            .send("DELETE", "/api/ringtones/ghost", Some(&owner), None)
            .await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);

        let intruder_list = ctx.send("GET", "/api/ringtones", Some(&intruder), None).await;
        assert_eq!(intruder_list.json(), json!([]));
    }

    #[tokio::test]
    async fn build_failure_is_generic_500() {
        let ctx = ApiTestContext::with_ytdlp(|bin| stubs::failing(bin, "yt-dlp")).await;
        let (_, token) = ctx.sign_in().await;

        let reply = ctx.create(&token, "My Clip").await;
        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(reply.json(), json!({ "error": "failed to create ringtone" }));

        let listed = ctx.send("GET", "/api/ringtones", Some(&token), None).await;
        assert_eq!(listed.json(), json!([]));
    }

    #[tokio::test]
    async fn video_info_returns_metadata() {
        let ctx = ApiTestContext::new().await;
        let (_, token) = ctx.sign_in().await;
        let reply = ctx
            .send(
                "POST",
                "/api/video-info",
                Some(&token),
                Some(json!({ "url": "https://valid.example/watch?v=abc" })),
            )
            .await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(
            reply.json(),
            json!({
                "title": "Stub Title",
                "duration": 212,
                "uploader": "Stub Uploader",
                "thumbnail": "https://img.example/thumb.jpg",
            })
        );
    }

    #[tokio::test]
    async fn video_info_failure_is_bad_request() {
        let ctx = ApiTestContext::with_ytdlp(|bin| stubs::failing(bin, "yt-dlp")).await;
        let (_, token) = ctx.sign_in().await;
        let reply = ctx
            .send(
                "POST",
                "/api/video-info",
                Some(&token),
                Some(json!({ "url": "https://valid.example/watch?v=abc" })),
            )
            .await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            reply.json(),
            json!({ "error": "could not fetch video information" })
        );

        let reply = ctx
            .send(
                "POST",
                "/api/video-info",
                Some(&token),
                Some(json!({ "url": "not a url" })),
            )
            .await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert_eq!(reply.json()["fields"][0]["field"], "url");
    }

    #[tokio::test]
    async fn config_exposes_bounds() {
        let ctx = ApiTestContext::new().await;
        let reply = ctx.send("GET", "/api/config", None, None).await;
        let body = reply.json();
        assert_eq!(body["baseUrl"], "http://127.0.0.1:8080");
        assert_eq!(body["minDurationSeconds"], 5.0);
        assert_eq!(body["maxDurationSeconds"], 60.0);
        assert_eq!(body["maxFileNameLength"], 50);
        assert_eq!(body["formats"], json!(["mp3", "m4a", "opus", "wav"]));
    }

    #[tokio::test]
    async fn downloads_support_ranges() {
        let ctx = ApiTestContext::new().await;
        let (user_id, token) = ctx.sign_in().await;
        ctx.create(&token, "Ranged").await;
        let uri = format!("/downloads/{user_id}/Ranged.mp3");

        let request = Request::builder()
            .uri(&uri)
            .header(header::RANGE, "bytes=1-2")
            .body(Body::empty())
            .unwrap();
        let response = router(ctx.state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 1-2/5");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ud");

        let request = Request::builder()
            .uri(&uri)
            .header(header::RANGE, "bytes=10-")
            .body(Body::empty())
            .unwrap();
        let response = router(ctx.state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */5");
    }

    #[tokio::test]
    async fn temporary_build_files_are_not_served() {
        let ctx = ApiTestContext::new().await;
        let dir = ctx.state.config.downloads_root.join("u1");
        std::fs::create_dir_all(&dir).unwrap();
        let name = "Clip.part-5f0c3a52-7d1e-4a8b-9c2f-0e4d6b8a1c3e.mp3";
        std::fs::write(dir.join(name), "audio").unwrap();
        std::fs::write(dir.join("Clip.mp3"), "audio").unwrap();

        let reply = ctx.send("GET", &format!("/downloads/u1/{name}"), None, None).await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
        let reply = ctx.send("GET", "/downloads/u1/Clip.mp3", None, None).await;
        assert_eq!(reply.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_paths_are_json_404() {
        let ctx = ApiTestContext::new().await;
        let reply = ctx.send("GET", "/api/nope", None, None).await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
        assert_eq!(reply.json(), json!({ "error": "endpoint not found" }));

        let reply = ctx.send("GET", "/downloads/u1/..", None, None).await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
    }
}
