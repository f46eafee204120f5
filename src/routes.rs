mod projects;
mod submissions;

pub use projects::post_project_handler;
pub use submissions::{post_compile_handler, post_test_handler};

use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse};
use serde::Serialize;

use crate::error::{EngineError, StoreError};

#[derive(Serialize)]
struct ErrorResponse {
    reason: &'static str,
    code: u32,
}

#[derive(Serialize)]
struct ErrorResponseWithMessage {
    reason: &'static str,
    code: u32,
    message: String,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
    });
    InternalError::from_response(err, response).into()
}

fn status_of(err: &EngineError) -> StatusCode {
    match err {
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        EngineError::TestSpecNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Store(StoreError::Unavailable { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn code_of(err: &EngineError) -> u32 {
    match err {
        e if e.is_client_error() => 1,
        EngineError::TestSpecNotFound(_) => 3,
        EngineError::Store(_) => 5,
        EngineError::Timeout(_) => 7,
        _ => 6,
    }
}

pub(crate) fn error_response(err: &EngineError) -> HttpResponse {
    let status = status_of(err);
    if status.is_server_error() {
        log::error!("Request failed: {err}");
    } else {
        log::debug!("Request rejected: {err}");
    }

    HttpResponse::build(status).json(ErrorResponseWithMessage {
        reason: err.reason(),
        code: code_of(err),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn errors_map_to_statuses() {
        assert_eq!(status_of(&EngineError::NoSourceProvided), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(&EngineError::InvalidIdentifier("../x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_of(&EngineError::TestSpecNotFound(4)), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(&EngineError::Timeout(Duration::from_secs(1))),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_of(&EngineError::Store(StoreError::Unavailable {
                attempts: 5,
                source: sqlx::Error::PoolClosed,
            })),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(&EngineError::Store(StoreError::Query(sqlx::Error::RowNotFound))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
