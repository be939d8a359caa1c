mod consume_loop;
pub mod consumer_group_usecase;
mod registry;
