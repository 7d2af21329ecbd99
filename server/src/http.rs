use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::json;
use std::fmt::{self, Display, Formatter};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::types::{AppState, Submission, User};

const REDACTED_USER: &str = "Anonymous";

#[derive(Debug)]
pub enum ApiError {
    InvalidCredentials,
    InvalidParameter(&'static str),
    NotFound,
    InternalServerError,
}

impl ApiError {
    fn to_code(&self) -> (&'static str, StatusCode) {
        match self {
            Self::InvalidCredentials => ("invalid_credentials", StatusCode::UNAUTHORIZED),
            Self::InvalidParameter(_) => ("invalid_parameter", StatusCode::BAD_REQUEST),
            Self::NotFound => ("not_found", StatusCode::NOT_FOUND),
            Self::InternalServerError => ("internal_error", StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCredentials => write!(f, "Invalid or missing token"),
            Self::InvalidParameter(name) => write!(f, "Invalid parameter: {name}"),
            Self::NotFound => write!(f, "Not found"),
            Self::InternalServerError => write!(f, "Internal server error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, status) = self.to_code();
        (
            status,
            Json(json!({
                "code": code,
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

fn ok_response(data: serde_json::Value) -> Json<serde_json::Value> {
    Json(json!({
        "code": 0,
        "message": "success",
        "data": data,
    }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/list", get(list_submissions))
        .route("/api/v1/status/:id", get(submission_status))
        .route("/api/v1/rank", get(rank))
        .route("/api/v1/my", get(my_submissions))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState) {
    let addr = state.config.api_addr.clone();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "Could not bind HTTP API");
            return;
        }
    };
    info!(addr = %addr, "HTTP API listening");

    if let Err(e) = axum::serve(listener, router(state)).await {
        error!(error = %e, "HTTP API server failed");
    }
}

/// All endpoints are read-only and authenticated by the `token` cookie.
async fn caller(state: &AppState, jar: &CookieJar) -> Result<(User, bool), ApiError> {
    let token = jar
        .get("token")
        .map(|cookie| cookie.value().to_string())
        .ok_or(ApiError::InvalidCredentials)?;

    let user = state
        .db
        .fetch_user_by_token(&token)
        .await
        .map_err(|e| {
            error!(error = %e, "Token lookup failed");
            ApiError::InternalServerError
        })?
        .ok_or(ApiError::InvalidCredentials)?;

    let admin = state.config.is_admin(&user.id);
    Ok((user, admin))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    page: Option<i64>,
    limit: Option<i64>,
}

fn validate_paging(query: &ListQuery) -> Result<(i64, i64), ApiError> {
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(20);
    if page <= 0 {
        return Err(ApiError::InvalidParameter("page"));
    }
    if limit <= 0 {
        return Err(ApiError::InvalidParameter("limit"));
    }
    Ok((page, limit))
}

/// Hides the owner of foreign rows from non-admin callers.
fn redact(mut sub: Submission, caller: &str, admin: bool) -> Submission {
    if !admin && sub.user != caller {
        sub.user = REDACTED_USER.to_string();
    }
    sub
}

async fn list_submissions(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (user, admin) = caller(&state, &jar).await?;
    let (page, limit) = validate_paging(&query)?;

    let total = state
        .db
        .count_submissions()
        .await
        .map_err(|_| ApiError::InternalServerError)?;
    let submissions = state
        .db
        .list_submissions(page, limit)
        .await
        .map_err(|_| ApiError::InternalServerError)?;
    let submissions: Vec<Submission> = submissions
        .into_iter()
        .map(|sub| redact(sub, &user.id, admin))
        .collect();

    Ok(ok_response(json!({
        "total": total,
        "submits": submissions,
    })))
}

async fn submission_status(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (user, admin) = caller(&state, &jar).await?;

    let sub = state
        .db
        .get_submission(&id)
        .await
        .map_err(|_| ApiError::InternalServerError)?
        .ok_or(ApiError::NotFound)?;

    // Foreign submissions are invisible rather than redacted here.
    if !admin && sub.user != user.id {
        return Err(ApiError::NotFound);
    }

    Ok(ok_response(serde_json::to_value(&sub).map_err(|_| {
        ApiError::InternalServerError
    })?))
}

async fn rank(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller(&state, &jar).await?;

    let users = state
        .db
        .list_users()
        .await
        .map_err(|_| ApiError::InternalServerError)?;

    Ok(ok_response(serde_json::to_value(&users).map_err(|_| {
        ApiError::InternalServerError
    })?))
}

async fn my_submissions(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (user, _) = caller(&state, &jar).await?;

    let submissions = state
        .db
        .list_user_submissions(&user.id)
        .await
        .map_err(|_| ApiError::InternalServerError)?;

    Ok(ok_response(serde_json::to_value(&submissions).map_err(
        |_| ApiError::InternalServerError,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Status;

    #[test]
    fn paging_rejects_zero_and_negative_pages() {
        assert!(validate_paging(&ListQuery {
            page: Some(0),
            limit: None
        })
        .is_err());
        assert!(validate_paging(&ListQuery {
            page: Some(-2),
            limit: None
        })
        .is_err());
        assert!(validate_paging(&ListQuery {
            page: None,
            limit: Some(0)
        })
        .is_err());
        assert_eq!(
            validate_paging(&ListQuery {
                page: None,
                limit: None
            })
            .unwrap(),
            (1, 20)
        );
    }

    #[test]
    fn foreign_rows_are_anonymous_for_regular_callers() {
        let mut sub = Submission::new("1".to_string(), "u2".to_string(), "p1".to_string());
        sub.status = Status::Completed;

        let redacted = redact(sub.clone(), "u1", false);
        assert_eq!(redacted.user, REDACTED_USER);

        let own = redact(sub.clone(), "u2", false);
        assert_eq!(own.user, "u2");

        let admin_view = redact(sub, "u1", true);
        assert_eq!(admin_view.user, "u2");
    }

    #[test]
    fn tokens_never_serialize() {
        let user = User::new("u1".to_string(), "secret".to_string());
        let value = serde_json::to_value(&user).unwrap();
        assert!(value.get("token").is_none());
        assert_eq!(value["id"], "u1");
    }
}
