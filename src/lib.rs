pub mod bridge;
pub mod client;
pub mod codec;
pub mod config;
pub mod daemon;
pub mod envelope;
pub mod error;
pub mod events;
pub mod formation;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod sim;
pub mod store;
pub mod transport;
