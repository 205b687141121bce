//! Local TCP proxy to a single kernel service

mod listener;

pub use listener::{LocalProxyListener, LocalTarget};
