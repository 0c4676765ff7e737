//! Anonymous sessions.
//!
//! A session is an opaque token stored next to the user it belongs to. The
//! browser keeps it in an `HttpOnly` cookie; scripted clients may send it as a
//! bearer token instead.

use axum::{
    Json,
    extract::{FromRequestParts, State},
    http::{HeaderMap, HeaderValue, header, request::Parts},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::info;

use crate::api::{ApiError, ApiResult, AppState};

pub const SESSION_COOKIE: &str = "ringping_session";

/// The caller behind a valid session token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub token: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("sign in required"))?;
        let user_id = state
            .store
            .session_user(&token)
            .await
            .map_err(ApiError::from_store)?
            .ok_or_else(|| ApiError::unauthorized("session expired or invalid"))?;
        Ok(Self { user_id, token })
    }
}

/// Bearer token first, then the session cookie.
fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(value) = value.to_str()
        && let Some(token) = value.strip_prefix("Bearer ")
        && !token.trim().is_empty()
    {
        return Some(token.trim().to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn session_cookie(token: &str) -> String {
    format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax")
}

fn expired_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInResponse {
    pub user_id: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub user_id: String,
}

pub async fn sign_in_anonymous(State(state): State<AppState>) -> ApiResult<Response> {
    let user_id = state.store.create_user().await.map_err(ApiError::from_store)?;
    let token = state
        .store
        .create_session(&user_id)
        .await
        .map_err(ApiError::from_store)?;
    info!(user_id = %user_id, "anonymous user signed in");

    let cookie = HeaderValue::from_str(&session_cookie(&token))
        .map_err(|_| ApiError::internal("internal server error"))?;
    let mut response = Json(SignInResponse { user_id, token }).into_response();
    response.headers_mut().insert(header::SET_COOKIE, cookie);
    Ok(response)
}

pub async fn current_session(user: AuthUser) -> Json<SessionResponse> {
    Json(SessionResponse {
        user_id: user.user_id,
    })
}

pub async fn sign_out(State(state): State<AppState>, user: AuthUser) -> ApiResult<Response> {
    state
        .store
        .delete_session(&user.token)
        .await
        .map_err(ApiError::from_store)?;
    info!(user_id = %user.user_id, "signed out");

    let cookie = HeaderValue::from_str(&expired_cookie())
        .map_err(|_| ApiError::internal("internal server error"))?;
    let mut response = Json(serde_json::json!({ "success": true })).into_response();
    response.headers_mut().insert(header::SET_COOKIE, cookie);
    Ok(response)
}
