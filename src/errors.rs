use rocket::http::{Header, Status};
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SonoError>;

#[derive(Error, Debug)]
pub enum SonoError {
    #[error("identity provider error: {0}")]
    UpstreamAuth(String),

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("{0}")]
    BadRequest(String),

    #[error("Unsupported media type {0}")]
    UnsupportedMediaType(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Forbidden(String),

    #[error("storage error {0:?}")]
    Storage(#[from] std::io::Error),

    #[error("database error {0:?}")]
    DbError(#[from] diesel::result::Error),

    #[error("multipart decoding error {0}")]
    MultipartError(#[from] multer::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SonoError {
    pub fn status(&self) -> Status {
        match self {
            SonoError::UpstreamAuth(_) => Status::ServiceUnavailable,
            SonoError::InvalidToken => Status::Unauthorized,
            SonoError::BadRequest(_) | SonoError::MultipartError(_) => Status::BadRequest,
            SonoError::UnsupportedMediaType(_) => Status::UnsupportedMediaType,
            SonoError::NotFound(_) => Status::NotFound,
            SonoError::Forbidden(_) => Status::Forbidden,
            SonoError::Storage(_) | SonoError::DbError(_) | SonoError::Other(_) => {
                Status::InternalServerError
            }
        }
    }

    /// Message safe to hand back to a client.
    pub fn detail(&self) -> String {
        if self.status() == Status::InternalServerError {
            "Internal server error".to_string()
        } else {
            self.to_string()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

/// Error rendered by the default catcher, for requests rejected before a
/// handler ran (guard failures, unknown routes, malformed bodies).
#[derive(Debug)]
pub struct Caught {
    pub status: Status,
    pub detail: String,
}

/// Detail left in the request-local cache by a failing request guard.
#[derive(Debug, Default)]
pub struct GuardDetail(pub Option<String>);

fn json_error<'r>(
    req: &'r rocket::Request<'_>,
    status: Status,
    detail: String,
) -> response::Result<'static> {
    let mut builder = response::Response::build_from(Json(ErrorBody { detail }).respond_to(req)?);
    builder.status(status);
    if status == Status::Unauthorized {
        builder.header(Header::new("WWW-Authenticate", "Bearer"));
    }
    builder.ok()
}

impl<'r> Responder<'r, 'static> for SonoError {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> response::Result<'static> {
        let status = self.status();
        if status == Status::InternalServerError {
            log::error!("got a generic error! {:?}", self);
        } else {
            log::debug!("request failed with {}: {}", status, self);
        }
        json_error(req, status, self.detail())
    }
}

impl<'r> Responder<'r, 'static> for Caught {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> response::Result<'static> {
        json_error(req, self.status, self.detail)
    }
}
