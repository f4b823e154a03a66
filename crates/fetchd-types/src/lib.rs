pub mod events;
pub mod metadata;
pub mod models;
pub mod network;
pub mod store;
