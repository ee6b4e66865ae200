use url::Url;

/// Returns whether `s` is empty or whitespace only.
pub fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

#[derive(thiserror::Error, Debug)]
pub enum UrlError {
    #[error("invalid URL: {0}")]
    Parse(#[from] url::ParseError),
    #[error("URL {0} must carry a scheme and host")]
    MissingHost(String),
}

/// Joins an endpoint path onto a base URL. The base must be absolute
/// (scheme and host present); the path is resolved against it.
pub fn join_url(base: &str, path: &str) -> Result<Url, UrlError> {
    let base = Url::parse(base)?;
    if !base.has_host() {
        return Err(UrlError::MissingHost(base.to_string()));
    }
    Ok(base.join(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_detection() {
        assert!(is_blank(""));
        assert!(is_blank("  \t"));
        assert!(!is_blank(" x "));
    }

    #[test]
    fn join_url_resolves_absolute_path() {
        let joined = join_url("http://localhost:9090", "/caas/v1/token/entity").unwrap();
        assert_eq!(joined.as_str(), "http://localhost:9090/caas/v1/token/entity");
    }

    #[test]
    fn join_url_rejects_missing_scheme() {
        assert!(join_url("localhost:9090/caas", "/x").is_err());
    }
}
