use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Creates a response with a plain-text body.
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Creates an empty-bodied response with the given status.
pub fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    text_response(status, Bytes::new())
}

/// Creates an error response with the status message as body.
pub fn make_error_response(status: StatusCode) -> Response<Full<Bytes>> {
    let message = status.canonical_reason().unwrap_or("an error occurred");
    text_response(status, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_carries_canonical_reason() {
        let response = make_error_response(StatusCode::NOT_FOUND);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn text_response_sets_status_and_body() {
        let response = text_response(StatusCode::CONFLICT, "Resource conflict");
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
