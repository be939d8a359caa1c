pub mod keyring_secret_repository;
pub mod sqlite_state_store;
