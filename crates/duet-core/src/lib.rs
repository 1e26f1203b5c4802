pub mod config;
pub mod lifecycle;
pub mod message;
pub mod store;
pub mod types;
