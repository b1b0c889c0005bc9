pub mod blob;
pub mod harvest;
pub mod serialize;
pub mod store;
pub mod types;
