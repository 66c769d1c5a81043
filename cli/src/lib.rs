//! The `confwatch` command line.
//!
//! Three commands on top of the `confwatch` library:
//!
//! - `config <server> <var> <val>` stores one value and prints `put <key>=<val>`
//! - `unset <server> <var>` removes one value and prints `delete <key>`
//! - `server <server>` prints the server's configuration as `{name=value, ...}`
//!   after the initial read and after every change, until interrupted
//!
//! The commands are plain async functions over any [`ConfigStore`] and
//! [`std::io::Write`], so they run the same against a remote store and an
//! in-memory one.
//!
//! [`ConfigStore`]: confwatch::ConfigStore

mod commands;
mod error;

pub use commands::{config, server, unset};
pub use error::Error;
