//! Single-threaded readiness multiplexer.
//!
//! The reactor knows nothing about filesystems or HTTP; it waits for any of
//! the registered descriptors to become ready and invokes the matching
//! callback. Deciding when to stop is the caller's job: the supervisor polls
//! the mount session's exit flag between iterations.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::{Error, Result};

/// Upper bound on concurrently registered sources.
///
/// The working set is a handful of always-open descriptors (kernel channel,
/// listener, signal pipe, short-lived HTTP connections); hitting this cap can
/// only mean a descriptor leak upstream.
pub const MAX_SOURCES: usize = 1024;

/// Which readiness events a source wants to be woken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    ReadableWritable,
}

impl Interest {
    fn wants_read(self) -> bool {
        matches!(self, Interest::Readable | Interest::ReadableWritable)
    }

    fn wants_write(self) -> bool {
        matches!(self, Interest::Writable | Interest::ReadableWritable)
    }

    fn poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.wants_read() {
            flags |= PollFlags::POLLIN;
        }
        if self.wants_write() {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }
}

/// A readiness-notifiable handle multiplexed by the [`Reactor`].
///
/// Both callbacks run on the control thread and must complete without
/// blocking; all blocking happens inside the reactor's wait. A callback may
/// register or unregister sources (including itself) through the `reactor`
/// argument. Returning an error short-circuits the iteration and is treated
/// by the caller as a fatal loop-exit condition.
pub trait EventSource {
    fn on_readable(&mut self, reactor: &mut Reactor) -> Result<()>;

    fn on_writable(&mut self, _reactor: &mut Reactor) -> Result<()> {
        Ok(())
    }
}

struct Registration {
    interest: Interest,
    source: Rc<RefCell<dyn EventSource>>,
}

/// Single-threaded, non-blocking event-multiplexing core.
///
/// The reactor holds a non-owning reference to every source; ownership stays
/// with whichever component registered it, and removal must be explicit
/// before the underlying descriptor is closed.
#[derive(Default)]
pub struct Reactor {
    sources: BTreeMap<RawFd, Registration>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `source`, waking it for the events in `interest`.
    ///
    /// Registering a descriptor twice or exceeding [`MAX_SOURCES`] is a
    /// resource-tracking bug upstream, reported as an error the caller must
    /// treat as fatal.
    pub fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        source: Rc<RefCell<dyn EventSource>>,
    ) -> Result<()> {
        assert!(fd >= 0, "event source with invalid descriptor");

        if self.sources.contains_key(&fd) {
            return Err(Error::AlreadyRegistered(fd));
        }

        if self.sources.len() >= MAX_SOURCES {
            return Err(Error::TooManySources);
        }

        self.sources.insert(fd, Registration { interest, source });

        Ok(())
    }

    /// Remove the source registered for `fd`.
    pub fn unregister(&mut self, fd: RawFd) -> Result<()> {
        match self.sources.remove(&fd) {
            Some(_) => Ok(()),
            None => Err(Error::NotRegistered(fd)),
        }
    }

    /// Change the readiness events `fd` is woken for.
    pub fn set_interest(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        match self.sources.get_mut(&fd) {
            Some(registration) => {
                registration.interest = interest;
                Ok(())
            }
            None => Err(Error::NotRegistered(fd)),
        }
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.sources.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Block until at least one source is ready and dispatch its callbacks.
    ///
    /// Ready sources are serviced in ascending descriptor order. A wait
    /// interrupted by a signal counts as an empty iteration. The first
    /// callback error aborts the iteration and is propagated to the caller.
    pub fn run_one_iteration(&mut self) -> Result<()> {
        let interests: Vec<(RawFd, Interest)> = self
            .sources
            .iter()
            .map(|(fd, registration)| (*fd, registration.interest))
            .collect();

        let mut poll_fds: Vec<PollFd> = interests
            .iter()
            .map(|(fd, interest)| {
                // The reactor never closes descriptors; the owning source is
                // responsible for unregistering before close, so borrowing
                // for the duration of the wait is sound.
                let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
                PollFd::new(borrowed, interest.poll_flags())
            })
            .collect();

        match poll(&mut poll_fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(()),
            Err(err) => return Err(Error::Wait(err)),
        }

        let ready: Vec<(RawFd, PollFlags)> = poll_fds
            .iter()
            .zip(interests.iter())
            .filter_map(|(poll_fd, (fd, _))| {
                let revents = poll_fd.revents().unwrap_or(PollFlags::empty());
                if revents.is_empty() {
                    None
                } else {
                    Some((*fd, revents))
                }
            })
            .collect();
        drop(poll_fds);

        for (fd, revents) in ready {
            // A closed-but-registered descriptor would otherwise make every
            // subsequent wait return instantly with the same POLLNVAL.
            if revents.contains(PollFlags::POLLNVAL) {
                error!("descriptor {fd} was closed while still registered");
                return Err(Error::InvalidDescriptor(fd));
            }

            // Hangups and errors surface through the read callback, which
            // observes EOF or the failure on its next receive.
            let readable = revents
                .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR);
            let writable = revents.intersects(PollFlags::POLLOUT);

            if readable {
                if let Some(source) = self.source_for(fd, Interest::wants_read) {
                    source.borrow_mut().on_readable(self)?;
                }
            }

            if writable {
                if let Some(source) = self.source_for(fd, Interest::wants_write) {
                    source.borrow_mut().on_writable(self)?;
                }
            }
        }

        Ok(())
    }

    /// Look the source up again right before dispatch: an earlier callback in
    /// the same iteration may have unregistered it or changed its interest.
    fn source_for(
        &self,
        fd: RawFd,
        wanted: fn(Interest) -> bool,
    ) -> Option<Rc<RefCell<dyn EventSource>>> {
        self.sources
            .get(&fd)
            .filter(|registration| wanted(registration.interest))
            .map(|registration| Rc::clone(&registration.source))
    }
}

#[cfg(test)]
mod test {
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    use pretty_assertions::assert_eq;

    use super::*;

    struct PipeSource {
        pipe: File,
        reads: usize,
        unregister_on_read: bool,
    }

    impl EventSource for PipeSource {
        fn on_readable(&mut self, reactor: &mut Reactor) -> Result<()> {
            let mut buf = [0u8; 16];
            let _ = self.pipe.read(&mut buf);
            self.reads += 1;
            if self.unregister_on_read {
                reactor.unregister(self.pipe.as_raw_fd())?;
            }
            Ok(())
        }
    }

    struct FailingSource {
        pipe: File,
    }

    impl EventSource for FailingSource {
        fn on_readable(&mut self, _reactor: &mut Reactor) -> Result<()> {
            let mut buf = [0u8; 16];
            let _ = self.pipe.read(&mut buf);
            Err(Error::ChannelRead(std::io::Error::other("boom")))
        }
    }

    fn pipe_pair() -> (File, File) {
        let (read, write) = nix::unistd::pipe().expect("failed to create pipe");
        (File::from(read), File::from(write))
    }

    #[test]
    fn register_same_source_twice_is_rejected() {
        let (read, _write) = pipe_pair();
        let fd = read.as_raw_fd();
        let source = Rc::new(RefCell::new(PipeSource {
            pipe: read,
            reads: 0,
            unregister_on_read: false,
        }));

        let mut reactor = Reactor::new();
        reactor
            .register(fd, Interest::Readable, source.clone())
            .expect("first registration failed");

        assert!(matches!(
            reactor.register(fd, Interest::Readable, source),
            Err(Error::AlreadyRegistered(rejected)) if rejected == fd
        ));
        // the original registration survives the rejected duplicate
        assert!(reactor.is_registered(fd));
        assert_eq!(reactor.len(), 1);
    }

    #[test]
    fn unregister_unknown_source_is_an_error() {
        let mut reactor = Reactor::new();
        assert!(matches!(reactor.unregister(42), Err(Error::NotRegistered(42))));
    }

    #[test]
    fn ready_source_is_dispatched() {
        let (read, mut write) = pipe_pair();
        let fd = read.as_raw_fd();
        let source = Rc::new(RefCell::new(PipeSource {
            pipe: read,
            reads: 0,
            unregister_on_read: false,
        }));

        let mut reactor = Reactor::new();
        reactor
            .register(fd, Interest::Readable, source.clone())
            .expect("registration failed");

        write.write_all(b"x").expect("write failed");
        reactor.run_one_iteration().expect("iteration failed");

        assert_eq!(source.borrow().reads, 1);
    }

    #[test]
    fn source_may_unregister_itself_during_dispatch() {
        let (read, mut write) = pipe_pair();
        let fd = read.as_raw_fd();
        let source = Rc::new(RefCell::new(PipeSource {
            pipe: read,
            reads: 0,
            unregister_on_read: true,
        }));

        let mut reactor = Reactor::new();
        reactor
            .register(fd, Interest::Readable, source.clone())
            .expect("registration failed");

        write.write_all(b"x").expect("write failed");
        reactor.run_one_iteration().expect("iteration failed");

        assert_eq!(source.borrow().reads, 1);
        assert!(!reactor.is_registered(fd));
    }

    #[test]
    fn callback_error_short_circuits_the_iteration() {
        let (read, mut write) = pipe_pair();
        let fd = read.as_raw_fd();
        let source = Rc::new(RefCell::new(FailingSource { pipe: read }));

        let mut reactor = Reactor::new();
        reactor
            .register(fd, Interest::Readable, source)
            .expect("registration failed");

        write.write_all(b"x").expect("write failed");
        assert!(matches!(
            reactor.run_one_iteration(),
            Err(Error::ChannelRead(_))
        ));
    }

    #[test]
    fn closed_descriptor_is_a_fatal_error() {
        struct IdleSource;

        impl EventSource for IdleSource {
            fn on_readable(&mut self, _reactor: &mut Reactor) -> Result<()> {
                Ok(())
            }
        }

        // a descriptor number nothing in this process ever opens, so the
        // wait reports it as invalid rather than ready
        let stale_fd = 900;

        let mut reactor = Reactor::new();
        reactor
            .register(stale_fd, Interest::Readable, Rc::new(RefCell::new(IdleSource)))
            .expect("registration failed");

        assert!(matches!(
            reactor.run_one_iteration(),
            Err(Error::InvalidDescriptor(fd)) if fd == stale_fd
        ));
    }

    #[test]
    fn sources_are_dispatched_in_ascending_fd_order() {
        let (read_a, mut write_a) = pipe_pair();
        let (read_b, mut write_b) = pipe_pair();
        let order = Rc::new(RefCell::new(Vec::new()));

        struct Recording {
            pipe: File,
            label: &'static str,
            order: Rc<RefCell<Vec<&'static str>>>,
        }

        impl EventSource for Recording {
            fn on_readable(&mut self, _reactor: &mut Reactor) -> Result<()> {
                let mut buf = [0u8; 16];
                let _ = self.pipe.read(&mut buf);
                self.order.borrow_mut().push(self.label);
                Ok(())
            }
        }

        // pipes are created in sequence, so a's fd is lower than b's
        let fd_a = read_a.as_raw_fd();
        let fd_b = read_b.as_raw_fd();
        assert!(fd_a < fd_b);

        let mut reactor = Reactor::new();
        reactor
            .register(
                fd_b,
                Interest::Readable,
                Rc::new(RefCell::new(Recording {
                    pipe: read_b,
                    label: "b",
                    order: order.clone(),
                })),
            )
            .expect("registration failed");
        reactor
            .register(
                fd_a,
                Interest::Readable,
                Rc::new(RefCell::new(Recording {
                    pipe: read_a,
                    label: "a",
                    order: order.clone(),
                })),
            )
            .expect("registration failed");

        write_b.write_all(b"x").expect("write failed");
        write_a.write_all(b"x").expect("write failed");
        reactor.run_one_iteration().expect("iteration failed");

        assert_eq!(*order.borrow(), vec!["a", "b"]);
    }
}
