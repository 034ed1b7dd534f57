pub mod agent;
pub mod approval;
pub mod cli;
pub mod config;
pub mod error;
pub mod locks;
pub mod messaging;
pub mod orchestration;
pub mod org;
pub mod store;
pub mod tasks;
pub mod tools;
