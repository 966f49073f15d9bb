use std::convert::Infallible;
use std::time::Duration;

use futures::stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tracing::error;
use uuid::Uuid;
use warp::sse::Event;
use warp::{Filter, Rejection, Reply};

use super::{ApiError, AppState, reject, with_state};
use crate::models::Task;

const STATUS_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct SseQuery {
  pub task_id: Uuid,
}

pub fn sse_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path("sse")
    .and(warp::path::end())
    .and(warp::get())
    .and(warp::query::<SseQuery>())
    .and(with_state(state))
    .and_then(handle_sse)
}

fn status_event(task: &Task) -> Event {
  Event::default().event("status").data(
    json!({
      "task_id": task.id,
      "status": task.status,
      "retries": task.retries,
      "result": task.result,
      "error_message": task.error_message,
    })
    .to_string(),
  )
}

/// Streams the task's status every couple of seconds. The stream ends right
/// after the first event that reports a terminal status.
async fn handle_sse(query: SseQuery, state: AppState) -> Result<impl Reply, Rejection> {
  let task_id = query.task_id;
  if state.store.get(task_id).await.map_err(|_| reject(ApiError::Internal))?.is_none() {
    return Err(reject(ApiError::NotFound("Task not found".into())));
  }

  let ticks = IntervalStream::new(tokio::time::interval(STATUS_INTERVAL));
  let store = state.store.clone();
  let events = stream::unfold(Some(ticks), move |ticks| {
    let store = store.clone();
    async move {
      let mut ticks = ticks?;
      ticks.next().await?;
      match store.get(task_id).await {
        Ok(Some(task)) => {
          let next = (!task.status.is_terminal()).then_some(ticks);
          Some((Ok::<Event, Infallible>(status_event(&task)), next))
        }
        Ok(None) => None,
        Err(e) => {
          error!(%task_id, "Error fetching task status: {:?}", e);
          None
        }
      }
    }
  });

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(events)))
}
