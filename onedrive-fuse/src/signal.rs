//! Termination signal handling.
//!
//! SIGINT and SIGTERM share one handler whose only action is writing a byte
//! to a self-pipe; nothing else is async-signal-safe. The pipe's read end is
//! a reactor source that drains the notification and requests the mount
//! session to exit on the control thread.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{Error, Result};
use crate::reactor::{EventSource, Reactor};
use crate::session::MountSession;

/// Write end of the self-pipe, reachable from handler context. -1 while no
/// handler is installed.
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_signal(_signal: libc::c_int) {
    let fd = NOTIFY_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [1u8];
        // best effort; EAGAIN means a wakeup is already pending
        unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
    }
}

/// Installed SIGINT/SIGTERM dispositions plus the notification pipe.
///
/// Dropping this without calling [`Signals::restore`] leaves the handlers
/// installed but pointed at a closed pipe, so the supervisor always restores
/// explicitly during teardown.
pub struct Signals {
    // keeps the handler's target alive
    _notify: OwnedFd,
    source_fd: RawFd,
}

impl Signals {
    /// Install the shared handler for SIGINT and SIGTERM and return the
    /// reactor source that consumes its notifications.
    ///
    /// If SIGTERM installation fails the already-installed SIGINT handler is
    /// rolled back before reporting the failure.
    pub fn install(session: Rc<MountSession>) -> Result<(Self, Rc<RefCell<SignalSource>>)> {
        let (read, write) = nix::unistd::pipe().map_err(Error::Signal)?;
        set_nonblocking(read.as_raw_fd()).map_err(Error::Signal)?;
        set_nonblocking(write.as_raw_fd()).map_err(Error::Signal)?;

        NOTIFY_FD.store(write.as_raw_fd(), Ordering::Relaxed);

        let action = SigAction::new(
            SigHandler::Handler(handle_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );

        if let Err(err) = unsafe { sigaction(Signal::SIGINT, &action) } {
            NOTIFY_FD.store(-1, Ordering::Relaxed);
            return Err(Error::Signal(err));
        }

        if let Err(err) = unsafe { sigaction(Signal::SIGTERM, &action) } {
            restore_default(Signal::SIGINT);
            NOTIFY_FD.store(-1, Ordering::Relaxed);
            return Err(Error::Signal(err));
        }

        debug!("signal handlers installed for SIGINT and SIGTERM");

        let source_fd = read.as_raw_fd();
        let source = Rc::new(RefCell::new(SignalSource {
            pipe: File::from(read),
            session,
        }));

        Ok((
            Self {
                _notify: write,
                source_fd,
            },
            source,
        ))
    }

    /// Descriptor of the pipe's read end, for reactor registration.
    pub fn source_fd(&self) -> RawFd {
        self.source_fd
    }

    /// Put both signals back to their default dispositions.
    pub fn restore(self) {
        restore_default(Signal::SIGTERM);
        restore_default(Signal::SIGINT);
        NOTIFY_FD.store(-1, Ordering::Relaxed);
        debug!("signal handlers restored");
    }
}

fn restore_default(signal: Signal) {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    if let Err(err) = unsafe { sigaction(signal, &action) } {
        error!("failed to restore handler for {}: {err}", signal.as_str());
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(nix::errno::Errno::last());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(nix::errno::Errno::last());
    }
    Ok(())
}

/// Reactor source draining the self-pipe.
pub struct SignalSource {
    pipe: File,
    session: Rc<MountSession>,
}

impl EventSource for SignalSource {
    fn on_readable(&mut self, _reactor: &mut Reactor) -> Result<()> {
        let mut buf = [0u8; 16];
        loop {
            match self.pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("failed to drain signal notification: {err}");
                    break;
                }
            }
        }

        info!("termination signal received, requesting session exit");
        self.session.request_exit();
        Ok(())
    }
}
