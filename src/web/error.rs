//! Mapping of connector results onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::connector::response::ConnectorResult;

impl IntoResponse for ConnectorResult {
    /// JSON for successes and errors. File results are streamed by the
    /// handlers; reaching here with one is a server error.
    fn into_response(self) -> Response {
        match self {
            ConnectorResult::Success(response) => Json(*response).into_response(),
            ConnectorResult::Error(error) => {
                let status = StatusCode::from_u16(error.status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (status, Json(error)).into_response()
            }
            ConnectorResult::File(file) => {
                tracing::error!(path = %file.path.display(), "File result was not streamed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}
