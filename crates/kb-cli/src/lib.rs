//! kbridge: Command-line front-end
//!
//! Provides the `kbridge` binary: `app` runs a local proxy to one service of
//! a compute session, `proxy` runs the API gateway.

pub mod commands;
pub mod output;
