//! Helpers for credential-safe store error reporting

use url::Url;

/// Redact credentials embedded in a store URL.
///
/// Connection strings can carry `:password@`; anything we log or put into an
/// error message goes through here first.
pub fn sanitize_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            if !parsed.username().is_empty() {
                let _ = parsed.set_username("***");
            }
            parsed.to_string()
        }
        Err(_) => "[invalid-url]".to_string(),
    }
}

/// Build a connection failure message naming only host and port
pub fn connection_error(url: &str, detail: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or("[unknown-host]");
            let port = parsed.port().unwrap_or(6379);
            format!("store connection to {host}:{port} failed: {detail}")
        }
        Err(_) => format!("store connection to {} failed: {detail}", sanitize_url(url)),
    }
}

/// Describe a client error by kind only, never by its full message
pub fn describe_redis_error(err: &redis::RedisError) -> &'static str {
    use redis::ErrorKind;
    match err.kind() {
        ErrorKind::AuthenticationFailed => "authentication failed",
        ErrorKind::ResponseError => "response error",
        ErrorKind::TypeError => "type error",
        ErrorKind::BusyLoadingError => "server loading data",
        ErrorKind::IoError => "io error",
        ErrorKind::ClientError => "client error",
        ErrorKind::ParseError => "parse error",
        _ => "store error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_redacted() {
        let sanitized = sanitize_url("redis://:sekret@stats.example.com:6379/0");
        assert!(!sanitized.contains("sekret"));
        assert!(sanitized.contains("stats.example.com:6379"));
    }

    #[test]
    fn bare_urls_unchanged() {
        let sanitized = sanitize_url("redis://localhost:6379");
        assert!(sanitized.contains("localhost:6379"));
        assert!(!sanitized.contains("***"));
    }

    #[test]
    fn invalid_url_gets_placeholder() {
        assert_eq!(sanitize_url("not a url"), "[invalid-url]");
    }

    #[test]
    fn connection_error_names_host_only() {
        let msg = connection_error("redis://user:pw@db.example.com:7000", "refused");
        assert!(msg.contains("db.example.com:7000"));
        assert!(msg.contains("refused"));
        assert!(!msg.contains("pw"));
    }
}
