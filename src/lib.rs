//! Cove — a line-oriented chat server that fans out across instances.
//!
//! Clients connect over plain TCP and exchange newline-terminated lines.
//! Every broadcast goes through a pub/sub bus, so sessions attached to
//! different server instances sharing a bus channel see each other's
//! messages.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use cove::chat::config::Config;
//! use cove::chat::server::ChatServer;
//!
//! let config = Config::from_env()?;
//! let server = ChatServer::start(&config, config.bus.connect()).await?;
//! println!("listening on {}", server.local_addr());
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod chat;

pub use chat::config::Config;
pub use chat::server::ChatServer;
