use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::json;
use tracing::error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::owner_actions::OwnerError;
use crate::store::TaskStore;

pub mod sse;
pub mod tasks;

static OWNER_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w.@\-]{1,64}$").unwrap());

#[derive(Clone)]
pub struct AppState {
  pub store: Arc<dyn TaskStore>,
  pub report_dir: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
  #[error("Missing x-owner-id header")]
  Unauthorized,

  #[error("{0}")]
  BadRequest(String),

  #[error("{0}")]
  NotFound(String),

  #[error("Not allowed")]
  Forbidden,

  #[error("{0}")]
  Conflict(String),

  #[error("Internal server error")]
  Internal,
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
  fn status(&self) -> StatusCode {
    match self {
      ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
      ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
      ApiError::NotFound(_) => StatusCode::NOT_FOUND,
      ApiError::Forbidden => StatusCode::FORBIDDEN,
      ApiError::Conflict(_) => StatusCode::CONFLICT,
      ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl From<OwnerError> for ApiError {
  fn from(err: OwnerError) -> Self {
    let message = err.to_string();
    match err {
      OwnerError::Invalid(_) => ApiError::BadRequest(message),
      OwnerError::NotFound => ApiError::NotFound(message),
      OwnerError::Forbidden => ApiError::Forbidden,
      OwnerError::NotCancellable(_) | OwnerError::Conflict => ApiError::Conflict(message),
      OwnerError::Store(e) => {
        error!("Store failure while serving request: {}", e);
        ApiError::Internal
      }
    }
  }
}

pub fn reject(err: impl Into<ApiError>) -> Rejection {
  warp::reject::custom(err.into())
}

pub fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
  warp::any().map(move || state.clone())
}

/// The caller's owner id. Identity is asserted by the gateway in front of the service.
pub fn with_owner() -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
  warp::header::optional::<String>("x-owner-id").and_then(|owner: Option<String>| async move {
    match owner {
      None => Err(reject(ApiError::Unauthorized)),
      Some(owner) if OWNER_ID.is_match(&owner) => Ok(owner),
      Some(_) => Err(reject(ApiError::BadRequest("Invalid x-owner-id header".into()))),
    }
  })
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
  let health = warp::path("health")
    .and(warp::path::end())
    .and(warp::get())
    .map(|| warp::reply::json(&json!({"status": "ok"})));

  health
    .or(tasks::task_routes(state.clone()))
    .or(sse::sse_route(state))
    .recover(handle_rejection)
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (code, message) = if let Some(api) = err.find::<ApiError>() {
    (api.status(), api.to_string())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "Not found".to_string())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if err.find::<warp::reject::InvalidQuery>().is_some() {
    (StatusCode::BAD_REQUEST, "Invalid query string".to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
  } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
    (StatusCode::UNSUPPORTED_MEDIA_TYPE, "Expected a JSON body".to_string())
  } else {
    error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
  };

  Ok(warp::reply::with_status(warp::reply::json(&json!({ "error": message })), code))
}
