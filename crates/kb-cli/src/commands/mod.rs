//! CLI command implementations

mod app;
mod config;
mod proxy;

pub use app::app_command;
pub use config::{config_init, config_show};
pub use proxy::proxy_command;
