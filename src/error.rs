use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("too many concurrent downloads for this client")]
    AdmissionDenied,

    #[error("malformed range: {0}")]
    MalformedRange(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for DownloadError {
    fn into_response(self) -> Response {
        match &self {
            // 429 carries no body.
            DownloadError::AdmissionDenied => StatusCode::TOO_MANY_REQUESTS.into_response(),
            DownloadError::MalformedRange(_) => {
                (StatusCode::RANGE_NOT_SATISFIABLE, self.to_string()).into_response()
            }
            DownloadError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()).into_response(),
            DownloadError::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
            }
        }
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            DownloadError::AdmissionDenied.into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            DownloadError::MalformedRange("x".into()).into_response().status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            DownloadError::NotFound("f".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        let io = std::io::Error::other("disk on fire");
        assert_eq!(
            DownloadError::from(io).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
