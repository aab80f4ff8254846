#![crate_name = "onedrive_fuse"]
#![crate_type = "lib"]

//! # onedrive-fuse
//!
//! Event-driven supervisor core for mounting a OneDrive account as a local
//! filesystem over FUSE.
//!
//! The crate multiplexes the kernel filesystem channel, the OAuth2
//! authorization server's sockets, and process signals on a single control
//! thread, and sequences process lifecycle around them: ordered startup,
//! optional fork-based daemonization with a synchronous parent/child
//! handshake, and ordered, idempotent shutdown.
//!
//! The filesystem operations themselves are external: implement
//! [`SessionHooks`] to translate kernel protocol buffers into remote API
//! calls and hand it to the [`Supervisor`].
//!
//! these features are supported:
//!
//! - `no-log`: disable logging. By default, this library will log via the `log` crate.

#[macro_use]
extern crate log;

pub mod auth;
pub mod channel;
pub mod config;
pub mod daemon;
mod error;
pub mod reactor;
pub mod session;
pub mod signal;
mod supervisor;

pub use self::auth::AuthCode;
pub use self::config::Config;
pub use self::error::{Error, Result};
pub use self::session::{ConnectionInfo, MountSession, SessionHooks, SessionState};
pub use self::supervisor::Supervisor;
