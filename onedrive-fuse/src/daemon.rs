//! Fork-based daemonization.
//!
//! The invoking shell must observe mount readiness synchronously, so the
//! parent blocks on a one-shot pipe until the child reports whether its
//! initialization succeeded, then exits with that result. The pipe is
//! created before the fork and each process keeps exactly one end.

use std::fs::File;
use std::io::{Read, Write};

use nix::unistd::{chdir, setsid};

use crate::error::{Error, Result};

/// One-shot boolean handoff from child to parent, created before forking.
pub struct Handshake {
    read: std::os::fd::OwnedFd,
    write: std::os::fd::OwnedFd,
}

/// Parent's half: waits for the child's report.
pub struct ParentHandshake {
    pipe: File,
}

/// Child's half: reports initialization outcome exactly once.
pub struct ChildHandshake {
    pipe: File,
}

impl Handshake {
    pub fn new() -> Result<Self> {
        let (read, write) = nix::unistd::pipe().map_err(Error::Daemonize)?;
        Ok(Self { read, write })
    }

    /// Keep the read end; the write end closes so a dying child shows up as
    /// EOF instead of a hang.
    pub fn into_parent(self) -> ParentHandshake {
        ParentHandshake {
            pipe: File::from(self.read),
        }
    }

    /// Keep the write end.
    pub fn into_child(self) -> ChildHandshake {
        ChildHandshake {
            pipe: File::from(self.write),
        }
    }
}

impl ParentHandshake {
    /// Block for exactly one boolean-sized result.
    ///
    /// A closed pipe or a short read means the child died before reporting;
    /// that counts as a failed initialization, not a protocol error to retry.
    pub fn wait(mut self) -> Result<bool> {
        let mut status = [0u8; 1];
        self.pipe
            .read_exact(&mut status)
            .map_err(Error::Handshake)?;
        Ok(status[0] != 0)
    }
}

impl ChildHandshake {
    /// Report the initialization outcome and close the pipe.
    pub fn report(mut self, success: bool) {
        let status = [u8::from(success)];
        if let Err(err) = self.pipe.write_all(&status) {
            error!("failed to write background initialization status: {err}");
        }
    }
}

/// Detach the child from the invoking environment: new session, neutral
/// working directory. Called in the child before initialization.
pub fn detach() -> Result<()> {
    setsid().map_err(Error::Daemonize)?;
    chdir("/").map_err(Error::Daemonize)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn success_report_reaches_the_parent() {
        let Handshake { read, write } = Handshake::new().expect("pipe failed");

        ChildHandshake {
            pipe: File::from(write),
        }
        .report(true);

        let result = ParentHandshake {
            pipe: File::from(read),
        }
        .wait()
        .expect("wait failed");
        assert!(result);
    }

    #[test]
    fn failure_report_reaches_the_parent() {
        let Handshake { read, write } = Handshake::new().expect("pipe failed");

        ChildHandshake {
            pipe: File::from(write),
        }
        .report(false);

        let result = ParentHandshake {
            pipe: File::from(read),
        }
        .wait()
        .expect("wait failed");
        assert!(!result);
    }

    #[test]
    fn a_dead_child_reads_as_failure() {
        let Handshake { read, write } = Handshake::new().expect("pipe failed");

        // the child vanishing closes the write end without a report
        drop(write);

        let result = ParentHandshake {
            pipe: File::from(read),
        }
        .wait();
        assert!(matches!(result, Err(Error::Handshake(_))));
    }
}
