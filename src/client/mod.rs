pub mod app;
pub mod config;
pub mod conversation;
pub mod friends;
pub mod relationships;
pub mod session;
pub mod suggestions;
