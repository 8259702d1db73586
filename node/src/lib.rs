pub mod config;
pub mod executor;
pub mod publish;
pub mod register;
pub mod relay_client;
pub mod service;
