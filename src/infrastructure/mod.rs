pub mod broadcast;
pub mod kafka;
pub mod persistence;
