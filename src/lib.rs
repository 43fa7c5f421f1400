//! Orchestration core for a WhatsApp chat automation service.

pub mod bridge_client;
pub mod classifier;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod poller;
pub mod processor;
pub mod rate_guard;
pub mod registration;
pub mod user_store;
