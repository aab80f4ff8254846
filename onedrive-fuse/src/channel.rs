//! The kernel filesystem channel.
//!
//! A mounted FUSE filesystem is serviced through a descriptor on
//! `/dev/fuse`. Unprivileged mounting goes through the setuid `fusermount`
//! helper, which performs the mount and passes the channel descriptor back
//! over a unix socket (the `_FUSE_COMMFD` handshake libfuse uses).

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

/// Environment variable through which `fusermount` is told where to send the
/// mounted channel descriptor.
const FUSE_COMMFD: &str = "_FUSE_COMMFD";

/// Mount helpers, in preference order.
const FUSERMOUNT: [&str; 2] = ["fusermount3", "fusermount"];

/// An fd-bearing transport for kernel protocol messages.
///
/// The bridge is generic over this seam so tests can drive it with a
/// pipe-backed fake instead of a real mount.
pub trait Channel: AsRawFd {
    /// One bounded receive of a protocol message. `Ok(0)` means the kernel
    /// has closed the session.
    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize>;

    /// Write one response buffer back to the kernel.
    fn send(&mut self, buffer: &[u8]) -> io::Result<()>;

    /// Release the mount. Must not be called while a wait on the descriptor
    /// is outstanding.
    fn unmount(&mut self) -> io::Result<()>;
}

/// The real `/dev/fuse` channel for one mounted filesystem.
pub struct FuseChannel {
    device: File,
    mount_point: PathBuf,
    mounted: bool,
}

impl FuseChannel {
    /// Mount `mount_point` and take ownership of the resulting channel
    /// descriptor.
    pub fn mount(mount_point: &Path) -> io::Result<Self> {
        let (local, remote) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(io::Error::from)?;

        let mut child = spawn_fusermount(mount_point, remote.as_raw_fd())?;
        // our copy of the helper's end must go away so a failed helper shows
        // up as EOF on the socket instead of a hang
        drop(remote);

        let received = receive_descriptor(local.as_raw_fd());
        let status = child.wait()?;
        let fd = received?;

        if !status.success() {
            return Err(io::Error::other(format!(
                "fusermount exited with {status}"
            )));
        }

        let device = unsafe { File::from_raw_fd(fd) };
        set_nonblocking(device.as_raw_fd())?;

        Ok(Self {
            device,
            mount_point: mount_point.to_path_buf(),
            mounted: true,
        })
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }
}

impl AsRawFd for FuseChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.device.as_raw_fd()
    }
}

impl Channel for FuseChannel {
    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        self.device.read(buffer)
    }

    fn send(&mut self, buffer: &[u8]) -> io::Result<()> {
        self.device.write_all(buffer)
    }

    fn unmount(&mut self) -> io::Result<()> {
        if !self.mounted {
            return Ok(());
        }
        self.mounted = false;

        // lazy unmount, so a busy mount point cannot wedge shutdown
        let mut spawn_error = None;
        for helper in FUSERMOUNT {
            match Command::new(helper)
                .arg("-u")
                .arg("-z")
                .arg("--")
                .arg(&self.mount_point)
                .status()
            {
                Ok(status) if status.success() => return Ok(()),
                Ok(status) => {
                    return Err(io::Error::other(format!(
                        "{helper} -u exited with {status}"
                    )))
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    spawn_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(spurious_not_found(spawn_error))
    }
}

impl Drop for FuseChannel {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(err) = self.unmount() {
                error!(
                    "failed to unmount {}: {err}",
                    self.mount_point.display()
                );
            }
        }
    }
}

fn spawn_fusermount(mount_point: &Path, comm_fd: RawFd) -> io::Result<std::process::Child> {
    let mut spawn_error = None;
    for helper in FUSERMOUNT {
        match Command::new(helper)
            .arg("-o")
            .arg("fsname=onedrive,subtype=onedrive")
            .arg("--")
            .arg(mount_point)
            .env(FUSE_COMMFD, comm_fd.to_string())
            .spawn()
        {
            Ok(child) => return Ok(child),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                spawn_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(spurious_not_found(spawn_error))
}

fn spurious_not_found(err: Option<io::Error>) -> io::Error {
    match err {
        Some(err) => io::Error::new(
            io::ErrorKind::NotFound,
            format!("no fusermount helper available: {err}"),
        ),
        None => io::Error::new(io::ErrorKind::NotFound, "no fusermount helper available"),
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receive the mounted channel descriptor `fusermount` passes back over the
/// communication socket.
///
/// Kept on raw `libc` because the `CMSG_*` accessors are the stable way to
/// walk ancillary data.
fn receive_descriptor(socket: RawFd) -> io::Result<RawFd> {
    let mut data = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: data.len(),
    };
    // 8-byte aligned buffer large enough for one descriptor-carrying cmsg
    let mut cmsg_buf = [0u64; 8];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = std::mem::size_of_val(&cmsg_buf) as _;

    let received = loop {
        let received = unsafe { libc::recvmsg(socket, &mut msg, 0) };
        if received >= 0 {
            break received;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    if received == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "fusermount closed the channel without passing a descriptor",
        ));
    }

    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let header = unsafe { &*cmsg };
        if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == libc::SCM_RIGHTS {
            let fd = unsafe { std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>()) };
            return Ok(fd);
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    Err(io::Error::other(
        "fusermount reply carried no channel descriptor",
    ))
}

/// Pipe-backed channel for exercising the bridge without a kernel mount.
#[doc(hidden)]
pub mod test_support {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    pub struct FakeChannel {
        incoming: File,
        sent: Rc<RefCell<Vec<Vec<u8>>>>,
        unmounted: Rc<RefCell<bool>>,
    }

    /// The test's half: feeds messages in and observes replies.
    pub struct FakeDriver {
        feed: Option<File>,
        sent: Rc<RefCell<Vec<Vec<u8>>>>,
        unmounted: Rc<RefCell<bool>>,
    }

    impl FakeChannel {
        pub fn pair() -> (FakeChannel, FakeDriver) {
            let (read, write) = nix::unistd::pipe().expect("failed to create pipe");
            let incoming = File::from(read);
            super::set_nonblocking(incoming.as_raw_fd()).expect("failed to set non-blocking");

            let sent = Rc::new(RefCell::new(Vec::new()));
            let unmounted = Rc::new(RefCell::new(false));
            (
                FakeChannel {
                    incoming,
                    sent: sent.clone(),
                    unmounted: unmounted.clone(),
                },
                FakeDriver {
                    feed: Some(File::from(write)),
                    sent,
                    unmounted,
                },
            )
        }
    }

    impl AsRawFd for FakeChannel {
        fn as_raw_fd(&self) -> RawFd {
            self.incoming.as_raw_fd()
        }
    }

    impl Channel for FakeChannel {
        fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
            self.incoming.read(buffer)
        }

        fn send(&mut self, buffer: &[u8]) -> io::Result<()> {
            self.sent.borrow_mut().push(buffer.to_vec());
            Ok(())
        }

        fn unmount(&mut self) -> io::Result<()> {
            *self.unmounted.borrow_mut() = true;
            Ok(())
        }
    }

    impl FakeDriver {
        /// Queue one message for the bridge to receive.
        pub fn push(&mut self, message: &[u8]) {
            self.feed
                .as_mut()
                .expect("channel already closed")
                .write_all(message)
                .expect("failed to feed message");
        }

        /// Close the channel, as the kernel does on unmount.
        pub fn close(&mut self) {
            self.feed.take();
        }

        pub fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.borrow().clone()
        }

        pub fn unmounted(&self) -> bool {
            *self.unmounted.borrow()
        }
    }
}
