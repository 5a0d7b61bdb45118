pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod peer_registry;
pub mod persistence;
pub mod pipeline;
pub mod protocol;
pub mod transfer;
