use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
#[error("{status_code} status code: {body}")]
pub struct ServerError {
    pub status_code: u16,
    pub body: String,
}

/// Pass the body through on a 2xx status, keep it for diagnostics otherwise.
pub fn check_status(status: StatusCode, body: String) -> Result<String, ServerError> {
    if !status.is_success() {
        return Err(ServerError {
            status_code: status.as_u16(),
            body,
        });
    }
    Ok(body)
}
