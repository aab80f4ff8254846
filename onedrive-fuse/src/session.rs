//! Mount session lifecycle and the kernel-channel bridge.

use std::cell::Cell;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::reactor::{EventSource, Reactor};

/// Largest protocol message the bridge will receive in one read.
///
/// Sized for the kernel's maximum write request plus header slack, matching
/// what the operation layer negotiates at `FUSE_INIT` time.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024 + 4096;

/// Lifecycle states of the one mount this process performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unmounted,
    Mounted,
    ExitRequested,
}

/// The core's model of one active mount's lifecycle.
///
/// Exactly one session exists per process; there is no remount. The state is
/// shared between the bridge, the signal source and the supervisor's run
/// loop, all of which execute on the single control thread.
#[derive(Debug)]
pub struct MountSession {
    state: Cell<SessionState>,
}

impl MountSession {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            state: Cell::new(SessionState::Unmounted),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Ask the session to end without waiting for the kernel to close the
    /// channel. Used by the signal path; idempotent.
    pub fn request_exit(&self) {
        if self.state.get() == SessionState::Mounted {
            self.state.set(SessionState::ExitRequested);
        }
    }

    /// Whether the session has ended; the run loop terminates only after
    /// observing this.
    pub fn is_exited(&self) -> bool {
        self.state.get() == SessionState::ExitRequested
    }

    pub(crate) fn set_mounted(&self) {
        self.state.set(SessionState::Mounted);
    }

    pub(crate) fn set_unmounted(&self) {
        self.state.set(SessionState::Unmounted);
    }
}

/// Details of a freshly established mount, passed to
/// [`SessionHooks::on_mount_ready`].
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub mount_point: PathBuf,
}

/// Hook points exposed to the external operation layer.
///
/// The core reads protocol buffers off the kernel channel but never
/// interprets them; translating them into remote API calls is the
/// implementor's job.
pub trait SessionHooks {
    /// Invoked once, after the filesystem has been mounted.
    fn on_mount_ready(&mut self, _connection: &ConnectionInfo) {}

    /// Invoked for every protocol buffer received on the kernel channel.
    /// Bytes returned here are written back to the channel as the
    /// filesystem's response.
    fn on_channel_message(&mut self, buffer: &[u8]) -> io::Result<Option<Vec<u8>>>;
}

/// Owns the mounted channel and pumps protocol messages to the hooks.
///
/// Registered with the reactor for read readiness; staying registered is
/// what re-arms the next receive, so a callback that must stop reading
/// simply unregisters itself.
pub struct ChannelBridge<C: Channel> {
    channel: C,
    hooks: Box<dyn SessionHooks>,
    session: Rc<MountSession>,
    buffer: Vec<u8>,
}

impl<C: Channel> ChannelBridge<C> {
    /// Take ownership of a freshly mounted channel. The session transitions
    /// to `Mounted` here; there is exactly one bridge per session.
    pub fn new(channel: C, hooks: Box<dyn SessionHooks>, session: Rc<MountSession>) -> Self {
        session.set_mounted();
        Self {
            channel,
            hooks,
            session,
            buffer: vec![0u8; MAX_MESSAGE_SIZE],
        }
    }

    pub fn fd(&self) -> RawFd {
        self.channel.as_raw_fd()
    }

    /// Explicitly request the session to end.
    pub fn exit(&self) {
        self.session.request_exit();
    }

    pub fn is_exited(&self) -> bool {
        self.session.is_exited()
    }

    pub fn notify_mount_ready(&mut self, info: &ConnectionInfo) {
        self.hooks.on_mount_ready(info);
    }

    /// Release the mount. Only safe after the bridge has been unregistered
    /// from the reactor, which the supervisor's teardown ordering guarantees.
    pub fn unmount(&mut self) -> io::Result<()> {
        self.channel.unmount()
    }
}

impl<C: Channel> EventSource for ChannelBridge<C> {
    fn on_readable(&mut self, reactor: &mut Reactor) -> Result<()> {
        // Once an exit has been requested no new reads are issued.
        if self.session.is_exited() {
            let _ = reactor.unregister(self.fd());
            return Ok(());
        }

        match self.channel.receive(&mut self.buffer) {
            Ok(0) => {
                debug!("kernel closed the channel, session exiting");
                self.session.request_exit();
                let _ = reactor.unregister(self.fd());
                Ok(())
            }
            Ok(len) => {
                let reply = self.hooks.on_channel_message(&self.buffer[..len]);
                match reply {
                    Ok(Some(reply)) => self
                        .channel
                        .send(&reply)
                        .map_err(Error::ChannelWrite),
                    Ok(None) => Ok(()),
                    Err(err) => {
                        let _ = reactor.unregister(self.fd());
                        Err(Error::Dispatch(err))
                    }
                }
            }
            Err(err) if spurious(&err) => Ok(()),
            Err(err) if unmounted(&err) => {
                debug!("kernel channel gone ({err}), session exiting");
                self.session.request_exit();
                let _ = reactor.unregister(self.fd());
                Ok(())
            }
            Err(err) => {
                error!("failed to read FUSE message: {err}");
                let _ = reactor.unregister(self.fd());
                Err(Error::ChannelRead(err))
            }
        }
    }
}

/// Wakeups that carry no message; the bridge stays armed and waits again.
fn spurious(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// The kernel reports `ENODEV` on the channel once the filesystem has been
/// unmounted from the outside; that is a clean exit, not a failure.
fn unmounted(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENODEV)
}
