pub mod coordinator;
pub mod slot;
