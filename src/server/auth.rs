use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use chrono::{TimeZone, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::routes::AppState;

/// Paths admitted with no credentials at all.
const SKIP_EXACT: &[&str] = &["/api/health", "/api/health/db"];
const SKIP_PREFIXES: &[&str] = &["/api/auth/", "/api/embed/", "/api/model-status/embed/"];

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: u64,
    exp: u64,
}

fn mint_token(secret: &[u8], expire_hours: u64) -> Result<(String, i64), jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp().max(0) as u64;
    let exp = now + expire_hours * 3600;
    let claims = Claims { sub: "admin".to_string(), iat: now, exp };
    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))?;
    Ok((token, exp as i64))
}

fn validate_bearer(req: &Request<Body>, secret: &[u8]) -> bool {
    let Some(header) = req.headers().get(axum::http::header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = header.to_str() else {
        return false;
    };
    let Some(token) = value.strip_prefix("Bearer ") else {
        return false;
    };

    let key = DecodingKey::from_secret(secret);
    let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.set_required_spec_claims(&["sub", "exp", "iat"]);
    validation.validate_exp = true;
    decode::<Claims>(token, &key, &validation).is_ok()
}

fn api_key_matches(req: &Request<Body>, configured: &str) -> bool {
    if configured.is_empty() {
        return false;
    }
    req.headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == configured)
        .unwrap_or(false)
}

/// Middleware guarding everything except the health endpoints, the auth
/// surface and the public status-page mirrors.
pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();

    if SKIP_EXACT.contains(&path) || SKIP_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return next.run(req).await;
    }

    if api_key_matches(&req, &state.config.auth.api_key)
        || validate_bearer(&req, &state.config.auth.jwt_secret)
    {
        return next.run(req).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "success": false,
            "error": { "code": "UNAUTHORIZED", "message": "missing or invalid credentials", "detail": "" },
        })),
    )
        .into_response()
}

// -- endpoints -----------------------------------------------------------

#[derive(Deserialize)]
pub struct LoginBody {
    pub password: String,
}

/// POST /api/auth/login
pub async fn login(State(state): State<AppState>, Json(body): Json<LoginBody>) -> Response {
    if body.password != state.config.auth.admin_password {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "success": false,
                "error": { "code": "UNAUTHORIZED", "message": "invalid password", "detail": "" },
            })),
        )
            .into_response();
    }

    match mint_token(&state.config.auth.jwt_secret, state.config.auth.jwt_expire_hours) {
        Ok((token, exp)) => {
            let expires_at = Utc
                .timestamp_opt(exp, 0)
                .single()
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_default();
            Json(serde_json::json!({
                "success": true,
                "token": token,
                "expires_at": expires_at,
            }))
            .into_response()
        }
        Err(e) => {
            tracing::error!(err = %e, "failed to mint JWT");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "success": false,
                    "error": { "code": "INTERNAL", "message": "token mint failed", "detail": "" },
                })),
            )
                .into_response()
        }
    }
}

/// POST /api/auth/logout — stateless tokens, nothing to revoke.
pub async fn logout() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "success": true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_header(name: &str, value: &str) -> Request<Body> {
        Request::builder()
            .uri("/api/dashboard/overview")
            .header(name, value)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn minted_tokens_validate() {
        let secret = b"test-secret";
        let (token, exp) = mint_token(secret, 24).unwrap();
        assert!(exp > Utc::now().timestamp());

        let req = request_with_header("authorization", &format!("Bearer {token}"));
        assert!(validate_bearer(&req, secret));
    }

    #[test]
    fn wrong_secret_fails() {
        let (token, _) = mint_token(b"secret-a", 24).unwrap();
        let req = request_with_header("authorization", &format!("Bearer {token}"));
        assert!(!validate_bearer(&req, b"secret-b"));
    }

    #[test]
    fn malformed_bearer_fails() {
        let secret = b"s";
        assert!(!validate_bearer(&request_with_header("authorization", "Bearer not.a.jwt"), secret));
        assert!(!validate_bearer(&request_with_header("authorization", "Basic abc"), secret));
        let no_header = Request::builder().uri("/x").body(Body::empty()).unwrap();
        assert!(!validate_bearer(&no_header, secret));
    }

    #[test]
    fn api_key_compare() {
        assert!(api_key_matches(&request_with_header("x-api-key", "k1"), "k1"));
        assert!(!api_key_matches(&request_with_header("x-api-key", "k2"), "k1"));
        // Empty configured key never matches.
        assert!(!api_key_matches(&request_with_header("x-api-key", ""), ""));
    }

    #[test]
    fn skip_lists_cover_public_surface() {
        assert!(SKIP_EXACT.contains(&"/api/health"));
        assert!(SKIP_EXACT.contains(&"/api/health/db"));
        for prefix in ["/api/auth/", "/api/embed/", "/api/model-status/embed/"] {
            assert!(SKIP_PREFIXES.contains(&prefix));
        }
    }
}
