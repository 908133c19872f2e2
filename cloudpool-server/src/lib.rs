pub mod config;
pub mod handlers;
pub mod quota;
pub mod routes;
pub mod state;
pub mod streamer;
pub mod tee;
