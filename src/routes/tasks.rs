use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use super::{ApiError, AppState, reject, with_owner, with_state};
use crate::models::{NewTask, Task, TaskStatus};
use crate::owner_actions::{self, parse_run_at};
use crate::report::report_path;

pub const REPORT_TASK_TYPE: &str = "generate_report";

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
  pub run_at: String,
  pub task_type: String,
  #[serde(default)]
  pub payload: serde_json::Value,
  pub max_retries: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
  pub task_id: Uuid,
  pub status: TaskStatus,
  pub sse_url: String,
}

pub fn task_routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  submit_route(state.clone())
    .or(list_route(state.clone()))
    .or(export_route(state.clone()))
    .or(get_route(state.clone()))
    .or(cancel_route(state.clone()))
    .or(report_route(state))
}

pub fn submit_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path("tasks")
    .and(warp::path::end())
    .and(warp::post())
    .and(with_owner())
    .and(warp::body::content_length_limit(64 * 1024))
    .and(warp::body::json())
    .and(with_state(state))
    .and_then(handle_submit_task)
}

pub fn list_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path("tasks")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_owner())
    .and(with_state(state))
    .and_then(handle_list_tasks)
}

pub fn export_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / "export.csv")
    .and(warp::get())
    .and(with_owner())
    .and(with_state(state))
    .and_then(handle_export_csv)
}

pub fn get_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / Uuid)
    .and(warp::get())
    .and(with_owner())
    .and(with_state(state))
    .and_then(handle_get_task)
}

pub fn cancel_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / Uuid / "cancel")
    .and(warp::post())
    .and(with_owner())
    .and(with_state(state))
    .and_then(handle_cancel_task)
}

pub fn report_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / Uuid / "report")
    .and(warp::get())
    .and(with_owner())
    .and(with_state(state))
    .and_then(handle_download_report)
}

async fn handle_submit_task(owner: String, request: SubmitRequest, state: AppState) -> Result<impl Reply, Rejection> {
  let run_at = parse_run_at(&request.run_at).map_err(reject)?;
  let new_task = NewTask {
    task_type: request.task_type,
    payload: request.payload,
    run_at,
    max_retries: request.max_retries,
  };
  let task = owner_actions::submit(state.store.as_ref(), &owner, new_task).await.map_err(reject)?;

  info!(task_id = %task.id, %owner, "Task {} submitted successfully", task.id);
  let response = TaskResponse {
    task_id: task.id,
    status: task.status,
    sse_url: format!("/sse?task_id={}", task.id),
  };
  Ok(warp::reply::with_status(warp::reply::json(&response), StatusCode::CREATED))
}

async fn handle_list_tasks(owner: String, state: AppState) -> Result<impl Reply, Rejection> {
  let tasks = owner_actions::list(state.store.as_ref(), &owner).await.map_err(reject)?;
  Ok(warp::reply::json(&json!({ "count": tasks.len(), "tasks": tasks })))
}

async fn handle_get_task(task_id: Uuid, owner: String, state: AppState) -> Result<impl Reply, Rejection> {
  let task = owner_actions::fetch(state.store.as_ref(), &owner, task_id).await.map_err(reject)?;
  Ok(warp::reply::json(&task))
}

async fn handle_cancel_task(task_id: Uuid, owner: String, state: AppState) -> Result<impl Reply, Rejection> {
  let task = owner_actions::cancel(state.store.as_ref(), &owner, task_id).await.map_err(reject)?;
  Ok(warp::reply::json(&json!({
    "message": "Task cancelled successfully",
    "task_id": task.id,
    "status": task.status,
  })))
}

async fn handle_export_csv(owner: String, state: AppState) -> Result<impl Reply, Rejection> {
  let tasks = owner_actions::list(state.store.as_ref(), &owner).await.map_err(reject)?;
  let reply = warp::reply::with_header(tasks_csv(&tasks), "content-type", "text/csv");
  Ok(warp::reply::with_header(reply, "content-disposition", "attachment; filename=tasks_export.csv"))
}

async fn handle_download_report(task_id: Uuid, owner: String, state: AppState) -> Result<impl Reply, Rejection> {
  let task = owner_actions::fetch(state.store.as_ref(), &owner, task_id).await.map_err(reject)?;
  if task.task_type != REPORT_TASK_TYPE {
    return Err(reject(ApiError::BadRequest(format!("Task {task_id} is not a report task"))));
  }

  let path = report_path(&state.report_dir, task_id);
  let bytes = match tokio::fs::read(&path).await {
    Ok(bytes) => bytes,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
      return Err(reject(ApiError::NotFound("Report not found".into())));
    }
    Err(e) => {
      error!(%task_id, "Failed to read report {}: {}", path.display(), e);
      return Err(reject(ApiError::Internal));
    }
  };

  let reply = warp::reply::with_header(bytes, "content-type", "application/pdf");
  Ok(warp::reply::with_header(
    reply,
    "content-disposition",
    format!("attachment; filename=report_{task_id}.pdf"),
  ))
}

const CSV_HEADER: [&str; 8] = ["ID", "Task Type", "Status", "Created At", "Run At", "Completed At", "Result", "Error"];

fn csv_field(field: &str) -> String {
  if field.contains([',', '"', '\n', '\r']) {
    format!("\"{}\"", field.replace('"', "\"\""))
  } else {
    field.to_string()
  }
}

fn csv_row<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
  let mut row = fields.into_iter().map(csv_field).collect::<Vec<_>>().join(",");
  row.push_str("\r\n");
  row
}

pub fn tasks_csv(tasks: &[Task]) -> String {
  let mut out = csv_row(CSV_HEADER);
  for task in tasks {
    let id = task.id.to_string();
    let created_at = task.created_at.to_rfc3339();
    let run_at = task.run_at.to_rfc3339();
    let completed_at = task.completed_at.map(|at| at.to_rfc3339()).unwrap_or_default();
    out.push_str(&csv_row([
      id.as_str(),
      task.task_type.as_str(),
      task.status.as_str(),
      created_at.as_str(),
      run_at.as_str(),
      completed_at.as_str(),
      task.result.as_deref().unwrap_or(""),
      task.error_message.as_deref().unwrap_or(""),
    ]));
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::routes::routes;
  use crate::store::{MemoryTaskStore, TaskStore, TaskUpdate};
  use std::path::PathBuf;
  use std::sync::Arc;

  fn state(store: Arc<MemoryTaskStore>) -> AppState {
    AppState { store, report_dir: std::env::temp_dir().join(format!("dtsched-routes-{}", Uuid::new_v4())) }
  }

  async fn submit(state: &AppState, owner: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let res = warp::test::request()
      .method("POST")
      .path("/tasks")
      .header("x-owner-id", owner)
      .json(&body)
      .reply(&routes(state.clone()))
      .await;
    (res.status(), serde_json::from_slice(res.body()).unwrap())
  }

  #[tokio::test]
  async fn submit_then_read_back() {
    let store = Arc::new(MemoryTaskStore::new());
    let state = state(store.clone());
    let (status, body) = submit(
      &state,
      "alice",
      json!({"run_at": "2030-01-01 08:00", "task_type": "send_message", "payload": "hi"}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "SCHEDULED");
    let task_id = body["task_id"].as_str().unwrap().to_string();
    assert_eq!(body["sse_url"], format!("/sse?task_id={task_id}"));

    let res = warp::test::request()
      .path(&format!("/tasks/{task_id}"))
      .header("x-owner-id", "alice")
      .reply(&routes(state.clone()))
      .await;
    assert_eq!(res.status(), StatusCode::OK);
    let task: Task = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(task.max_retries, 3);

    let res = warp::test::request()
      .path(&format!("/tasks/{task_id}"))
      .header("x-owner-id", "mallory")
      .reply(&routes(state.clone()))
      .await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = warp::test::request().path("/tasks").header("x-owner-id", "alice").reply(&routes(state)).await;
    let listing: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(listing["count"], 1);
  }

  #[tokio::test]
  async fn submit_rejects_bad_input() {
    let state = state(Arc::new(MemoryTaskStore::new()));
    let (status, body) = submit(&state, "alice", json!({"run_at": "soon", "task_type": "send_message"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("run_at"));

    let (status, _) = submit(
      &state,
      "alice",
      json!({"run_at": "2030-01-01 08:00", "task_type": "send_message", "max_retries": 42}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let res = warp::test::request()
      .method("POST")
      .path("/tasks")
      .json(&json!({"run_at": "2030-01-01 08:00", "task_type": "send_message"}))
      .reply(&routes(state))
      .await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn cancel_codes() {
    let store = Arc::new(MemoryTaskStore::new());
    let state = state(store.clone());
    let (_, body) = submit(&state, "alice", json!({"run_at": "2030-01-01 08:00", "task_type": "send_message"})).await;
    let task_id: Uuid = body["task_id"].as_str().unwrap().parse().unwrap();
    let cancel = |owner: &'static str, id: Uuid| {
      warp::test::request()
        .method("POST")
        .path(&format!("/tasks/{id}/cancel"))
        .header("x-owner-id", owner)
    };

    assert_eq!(cancel("alice", Uuid::new_v4()).reply(&routes(state.clone())).await.status(), StatusCode::NOT_FOUND);
    assert_eq!(cancel("bob", task_id).reply(&routes(state.clone())).await.status(), StatusCode::FORBIDDEN);
    assert_eq!(cancel("alice", task_id).reply(&routes(state.clone())).await.status(), StatusCode::OK);

    let res = cancel("alice", task_id).reply(&routes(state)).await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(body["error"], "Task already CANCELLED, cannot cancel");
    assert_eq!(store.get(task_id).await.unwrap().unwrap().status, TaskStatus::Cancelled);
  }

  #[tokio::test]
  async fn export_csv_quotes_awkward_fields() {
    let store = Arc::new(MemoryTaskStore::new());
    let state = state(store.clone());
    let (_, body) = submit(&state, "alice", json!({"run_at": "2030-01-01 08:00", "task_type": "send_message"})).await;
    let task_id: Uuid = body["task_id"].as_str().unwrap().parse().unwrap();
    let update = TaskUpdate::status(TaskStatus::Failed).with_error("bad \"thing\", twice");
    store.update(task_id, &update, None).await.unwrap();

    let res = warp::test::request().path("/tasks/export.csv").header("x-owner-id", "alice").reply(&routes(state)).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-type"], "text/csv");
    let text = String::from_utf8(res.body().to_vec()).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("ID,Task Type,Status,Created At,Run At,Completed At,Result,Error"));
    let row = lines.next().unwrap();
    assert!(row.starts_with(&format!("{task_id},send_message,FAILED,")));
    assert!(row.ends_with(",\"bad \"\"thing\"\", twice\""));
  }

  #[tokio::test]
  async fn report_download_needs_a_rendered_file() {
    let store = Arc::new(MemoryTaskStore::new());
    let state = state(store.clone());
    let (_, body) = submit(&state, "alice", json!({"run_at": "2030-01-01 08:00", "task_type": "generate_report"})).await;
    let task_id: Uuid = body["task_id"].as_str().unwrap().parse().unwrap();
    let path = format!("/tasks/{task_id}/report");

    let res = warp::test::request().path(&path).header("x-owner-id", "alice").reply(&routes(state.clone())).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let dir: PathBuf = state.report_dir.clone();
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(report_path(&dir, task_id), b"%PDF-1.4").await.unwrap();
    let res = warp::test::request().path(&path).header("x-owner-id", "alice").reply(&routes(state)).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-type"], "application/pdf");
    assert_eq!(res.body().as_ref(), b"%PDF-1.4");
    let _ = tokio::fs::remove_dir_all(dir).await;
  }
}
