use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A source may be registered with the reactor at most once.
    #[error("event source for fd {0} is already registered")]
    AlreadyRegistered(RawFd),
    /// Removal of a source that was never registered. Recoverable.
    #[error("event source for fd {0} is not registered")]
    NotRegistered(RawFd),
    /// The registered-source set stays small; exceeding the cap means a
    /// descriptor is being leaked upstream.
    #[error("too many event sources registered")]
    TooManySources,
    /// The descriptor was closed while still registered; the owning source
    /// must unregister before close.
    #[error("event source for fd {0} refers to a closed descriptor")]
    InvalidDescriptor(RawFd),
    #[error("failed to wait for events: {0}")]
    Wait(#[source] nix::Error),
    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] nix::Error),
    #[error("failed to bind authorization server to 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to mount filesystem at {path}: {source}")]
    Mount {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read FUSE message: {0}")]
    ChannelRead(#[source] io::Error),
    #[error("failed to write FUSE reply: {0}")]
    ChannelWrite(#[source] io::Error),
    #[error("filesystem operation layer failed: {0}")]
    Dispatch(#[source] io::Error),
    #[error("failed to daemonize: {0}")]
    Daemonize(#[source] nix::Error),
    #[error("failed to exchange background initialization status: {0}")]
    Handshake(#[source] io::Error),
    /// The child reported that it could not finish initialization.
    #[error("background process failed to initialize")]
    HandshakeFailed,
    /// The supervisor mounts at most once per process; there is no remount.
    #[error("mount session was already started")]
    AlreadyStarted,
}
