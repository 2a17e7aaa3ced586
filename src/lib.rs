pub mod aggregate;
pub mod api;
pub mod auth;
pub mod config;
pub mod data_store;
pub mod hydration;
pub mod semantic_model;
pub mod server;

pub use server::{AppState, Server};
