pub mod config;
pub mod database;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod mail;
pub mod models;
pub mod owner_actions;
pub mod payload;
pub mod poller;
pub mod report;
pub mod retry;
pub mod routes;
pub mod state_machine;
pub mod store;
pub mod telemetry;
pub mod worker_processing;
pub mod worker_scheduler;
