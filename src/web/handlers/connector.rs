//! Connector endpoint handlers.

use axum::{
    body::Body,
    extract::{FromRequest, Multipart, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Form,
};
use std::sync::Arc;
use tokio_util::io::ReaderStream;

use crate::connector::response::{ConnectorResult, FileResult};
use crate::connector::ConnectorCommand;
use crate::driver::UploadFile;
use crate::web::handlers::AppState;
use crate::ConnectorError;

/// Field carrying uploaded files.
const UPLOAD_FIELD: &str = "upload[]";

/// Generate a safe Content-Disposition header value.
///
/// Control characters are dropped and quotes or backslashes replaced in the
/// plain `filename` parameter; non-ASCII names also get an RFC 5987
/// `filename*` parameter.
pub fn content_disposition_header(disposition: &str, filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '"' | '\\' => '_',
            _ => c,
        })
        .collect();

    if filename.is_ascii() && sanitized == filename {
        return format!("{disposition}; filename=\"{filename}\"");
    }

    let encoded = urlencoding::encode(filename);
    format!("{disposition}; filename=\"{sanitized}\"; filename*=UTF-8''{encoded}")
}

/// Build a command from decoded parameter pairs.
fn command_from_pairs(pairs: Vec<(String, String)>) -> ConnectorCommand {
    let mut command = ConnectorCommand::default();
    for (key, value) in pairs {
        push_param(&mut command, key, value);
    }
    command
}

fn push_param(command: &mut ConnectorCommand, key: String, value: String) {
    match key.as_str() {
        "cmd" => command.cmd = Some(value),
        "reqid" => command.request_id = Some(value),
        _ => command.push_arg(key, value),
    }
}

async fn command_from_multipart(mut multipart: Multipart) -> Result<ConnectorCommand, ConnectorError> {
    let invalid = |_| ConnectorError::CommandParams("upload".to_string());
    let mut command = ConnectorCommand::default();
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match field.file_name().map(str::to_string) {
            Some(file_name) if name == UPLOAD_FIELD => {
                let content = field.bytes().await.map_err(invalid)?;
                command.files.push(UploadFile::new(file_name, content.to_vec()));
            }
            _ => {
                let value = field.text().await.map_err(invalid)?;
                push_param(&mut command, name, value);
            }
        }
    }
    Ok(command)
}

/// GET /connector - Run a command from query parameters.
pub async fn connector_get(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let result = state.connector.process(command_from_pairs(pairs)).await;
    reply(result).await
}

/// POST /connector - Run a command from a form or multipart body.
pub async fn connector_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
) -> Response {
    let is_multipart = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    let command = if is_multipart {
        match Multipart::from_request(request, &state).await {
            Ok(multipart) => command_from_multipart(multipart).await,
            Err(e) => {
                tracing::debug!(error = %e, "Rejected multipart body");
                Err(ConnectorError::CommandParams("upload".to_string()))
            }
        }
    } else {
        match Form::<Vec<(String, String)>>::from_request(request, &state).await {
            Ok(Form(pairs)) => Ok(command_from_pairs(pairs)),
            Err(e) => {
                tracing::debug!(error = %e, "Rejected form body");
                Err(ConnectorError::CommandRequired)
            }
        }
    };

    match command {
        Ok(command) => reply(state.connector.process(command).await).await,
        Err(e) => ConnectorResult::from(e).into_response(),
    }
}

/// GET /connector/thumb/:hash - Thumbnail of a file, empty when none exists.
pub async fn thumbnail(State(state): State<Arc<AppState>>, Path(hash): Path<String>) -> Response {
    match state.connector.thumbnail(&hash).await {
        Ok(Some(file)) => reply(ConnectorResult::File(file)).await,
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => ConnectorResult::from(e).into_response(),
    }
}

async fn reply(result: ConnectorResult) -> Response {
    match result {
        ConnectorResult::File(file) => match stream_file(&file).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(path = %file.path.display(), error = %e, "Failed to stream file");
                ConnectorResult::from(e).into_response()
            }
        },
        other => other.into_response(),
    }
}

async fn stream_file(file: &FileResult) -> Result<Response, ConnectorError> {
    let handle = tokio::fs::File::open(&file.path).await?;
    let length = handle.metadata().await?.len();
    if file.delete_after {
        // The open handle keeps the content readable.
        if let Err(e) = tokio::fs::remove_file(&file.path).await {
            tracing::warn!(path = %file.path.display(), error = %e, "Failed to remove staged file");
        }
    }

    let disposition = if file.attachment { "attachment" } else { "inline" };
    let body = Body::from_stream(ReaderStream::new(handle));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &file.mime)
        .header(header::CONTENT_LENGTH, length)
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition_header(disposition, &file.name),
        )
        .body(body)
        .map_err(|e| ConnectorError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
}
