pub mod accumulator;
pub mod auth;
pub mod chat_api;
pub mod config;
pub mod conversation;
pub mod decoder;
pub mod documents;
pub mod error;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod session;
pub mod stream;
pub mod telemetry;
pub mod transport;
