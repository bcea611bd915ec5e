pub mod bus;
pub mod codec;
pub mod command;
pub mod config;
pub mod memory;
pub mod redis;
pub mod registry;
pub mod resp;
pub mod server;
pub mod session;
pub mod subscriber;
