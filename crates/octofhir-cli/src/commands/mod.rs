pub mod auth;
pub mod read;
pub mod search;
pub mod server;
