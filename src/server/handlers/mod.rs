pub mod admin;
pub mod aiban;
pub mod dashboard;
pub mod ip;
pub mod model_status;
pub mod risk;
pub mod status_page;
pub mod system;

use crate::analytics::window_seconds;
use crate::error::SentinelError;

use super::envelope::ApiError;

/// Validate an optional `window` query parameter, defaulting when
/// absent.
pub(crate) fn parse_window(window: Option<&str>, default: &str) -> Result<String, ApiError> {
    let name = window.unwrap_or(default);
    if window_seconds(name).is_none() {
        return Err(ApiError(SentinelError::InvalidParam(format!(
            "unknown window: {name}"
        ))));
    }
    Ok(name.to_string())
}

pub(crate) fn parse_window_secs(window: Option<&str>, default: &str) -> Result<i64, ApiError> {
    let name = parse_window(window, default)?;
    Ok(window_seconds(&name).unwrap_or(86_400))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_defaults_and_rejects() {
        assert_eq!(parse_window(None, "24h").unwrap(), "24h");
        assert_eq!(parse_window(Some("1h"), "24h").unwrap(), "1h");
        assert!(parse_window(Some("5m"), "24h").is_err());
        assert_eq!(parse_window_secs(Some("3h"), "24h").unwrap(), 10_800);
    }
}
