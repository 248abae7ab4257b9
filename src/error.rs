use thiserror::Error;

#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("config error: {0}")]
    Config(String),

    #[error("gateway database error: {0}")]
    Gateway(#[from] sqlx::Error),

    #[error("local store error: {0}")]
    Local(#[from] rusqlite::Error),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("upstream {error_type} error: {message}")]
    Upstream {
        error_type: String,
        message: String,
        wait_seconds: Option<u64>,
    },

    #[error("geoip error: {0}")]
    GeoIp(String),

    #[error("AI verdict error: {0}")]
    Verdict(String),

    #[error("query timed out after {0} seconds")]
    Timeout(u64),
}

impl SentinelError {
    /// Short machine-readable code used in the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            SentinelError::Config(_) => "CONFIG_ERROR",
            SentinelError::Gateway(_) => "DB_ERROR",
            SentinelError::Local(_) => "LOCAL_STORE_ERROR",
            SentinelError::Cache(_) => "CACHE_ERROR",
            SentinelError::Http(_) => "HTTP_ERROR",
            SentinelError::Json(_) => "JSON_ERROR",
            SentinelError::Io(_) => "IO_ERROR",
            SentinelError::InvalidParam(_) => "INVALID_PARAM",
            SentinelError::NotFound(_) => "NOT_FOUND",
            SentinelError::Unauthorized(_) => "UNAUTHORIZED",
            SentinelError::Conflict(_) => "CONFLICT",
            SentinelError::Upstream { .. } => "UPSTREAM_ERROR",
            SentinelError::GeoIp(_) => "GEOIP_ERROR",
            SentinelError::Verdict(_) => "AI_VERDICT_ERROR",
            SentinelError::Timeout(_) => "QUERY_TIMEOUT",
        }
    }
}

pub type Result<T> = std::result::Result<T, SentinelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let cases: Vec<(SentinelError, &str)> = vec![
            (SentinelError::Config("bad dsn".into()), "config error: bad dsn"),
            (SentinelError::Cache("redis gone".into()), "cache error: redis gone"),
            (SentinelError::InvalidParam("window".into()), "invalid parameter: window"),
            (SentinelError::NotFound("top-up 42".into()), "not found: top-up 42"),
            (SentinelError::Unauthorized("no token".into()), "unauthorized: no token"),
            (SentinelError::Conflict("already refunded".into()), "conflict: already refunded"),
            (SentinelError::GeoIp("no mmdb".into()), "geoip error: no mmdb"),
            (SentinelError::Verdict("bad json".into()), "AI verdict error: bad json"),
            (SentinelError::Timeout(30), "query timed out after 30 seconds"),
        ];
        for (err, expected) in cases {
            assert_eq!(err.to_string(), expected);
        }
    }

    #[test]
    fn upstream_error_carries_type() {
        let err = SentinelError::Upstream {
            error_type: "rate_limit".into(),
            message: "slow down".into(),
            wait_seconds: Some(30),
        };
        assert_eq!(err.to_string(), "upstream rate_limit error: slow down");
        assert_eq!(err.code(), "UPSTREAM_ERROR");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SentinelError = io_err.into();
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{{bad").unwrap_err();
        let err: SentinelError = json_err.into();
        assert!(err.to_string().starts_with("JSON error:"));
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(SentinelError::InvalidParam(String::new()).code(), "INVALID_PARAM");
        assert_eq!(SentinelError::NotFound(String::new()).code(), "NOT_FOUND");
        assert_eq!(SentinelError::Timeout(0).code(), "QUERY_TIMEOUT");
    }
}
