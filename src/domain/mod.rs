pub mod broker;
pub mod error;
pub mod event;
pub mod instance;
pub mod log;
pub mod repository;
