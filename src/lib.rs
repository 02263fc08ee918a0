//! LAN file-sharing server.
//!
//! The library wires HTTP routing, path containment, per-IP login
//! sessions, zip packing and static page delivery behind the lifecycle
//! surface a control layer drives: [`Server::start`], [`Server::stop`],
//! [`Server::reconfigure`], [`Server::is_running`] and
//! [`Server::subscribe_logs`].

pub mod archive;
pub mod auth;
pub mod background;
pub mod config;
pub mod error;
pub mod files;
pub mod frontend;
pub mod http;
pub mod logging;
pub mod server;
pub mod share;
pub mod state;
pub mod upload;

pub use config::{Args, ServerConfig, load_config, save_config};
pub use server::Server;
