// src/cascadellm/mod.rs

pub mod agent;
pub mod cache;
pub mod clients;
pub mod config;
pub mod credentials;
pub mod event;
pub mod http_client_pool;
pub mod inference;
pub mod knowledge;
pub mod model;
pub mod orchestrator;
pub mod registry;
