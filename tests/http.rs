use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio_test::assert_ok;

use dtsched::routes::{AppState, routes};
use dtsched::store::MemoryTaskStore;

fn spawn_api() -> SocketAddr {
  let state = AppState {
    store: Arc::new(MemoryTaskStore::new()),
    report_dir: std::env::temp_dir().join("dtsched-http-test"),
  };
  let (addr, server) = warp::serve(routes(state)).bind_ephemeral(([127, 0, 0, 1], 0));
  tokio::spawn(server);
  addr
}

#[tokio::test]
async fn owner_can_schedule_list_and_cancel_over_http() {
  let base = format!("http://{}", spawn_api());
  let client = reqwest::Client::new();

  let health = assert_ok!(client.get(format!("{base}/health")).send().await);
  assert_eq!(health.status(), reqwest::StatusCode::OK);

  let created = assert_ok!(
    client
      .post(format!("{base}/tasks"))
      .header("x-owner-id", "carol")
      .json(&json!({
        "run_at": "2031-06-01T12:00:00Z",
        "task_type": "send_email",
        "payload": {"to": "dave@example.com", "subject": "Reminder"},
        "max_retries": 2
      }))
      .send()
      .await
  );
  assert_eq!(created.status(), reqwest::StatusCode::CREATED);
  let created: Value = assert_ok!(created.json().await);
  let task_id = created["task_id"].as_str().unwrap().to_string();

  let listing: Value = assert_ok!(
    assert_ok!(client.get(format!("{base}/tasks")).header("x-owner-id", "carol").send().await)
      .json()
      .await
  );
  assert_eq!(listing["count"], 1);
  assert_eq!(listing["tasks"][0]["max_retries"], 2);
  assert_eq!(listing["tasks"][0]["run_at"], "2031-06-01T12:00:00Z");

  let forbidden = assert_ok!(
    client
      .post(format!("{base}/tasks/{task_id}/cancel"))
      .header("x-owner-id", "eve")
      .send()
      .await
  );
  assert_eq!(forbidden.status(), reqwest::StatusCode::FORBIDDEN);

  let cancelled = assert_ok!(
    client
      .post(format!("{base}/tasks/{task_id}/cancel"))
      .header("x-owner-id", "carol")
      .send()
      .await
  );
  assert_eq!(cancelled.status(), reqwest::StatusCode::OK);
  let body: Value = assert_ok!(cancelled.json().await);
  assert_eq!(body["status"], "CANCELLED");

  let anonymous = assert_ok!(client.get(format!("{base}/tasks")).send().await);
  assert_eq!(anonymous.status(), reqwest::StatusCode::UNAUTHORIZED);
  let body: Value = assert_ok!(anonymous.json().await);
  assert_eq!(body["error"], "Missing x-owner-id header");
}
