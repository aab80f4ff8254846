//! Placeholder operation layer.
//!
//! Answers the kernel's `FUSE_INIT` negotiation so the mount comes up, then
//! replies `ENOSYS` to everything else. The remote OneDrive translation
//! plugs in here by replacing this implementation.

use std::io;

use onedrive_fuse::session::MAX_MESSAGE_SIZE;
use onedrive_fuse::{ConnectionInfo, SessionHooks};

const FUSE_FORGET: u32 = 2;
const FUSE_INIT: u32 = 26;
const FUSE_INTERRUPT: u32 = 36;
const FUSE_BATCH_FORGET: u32 = 42;

const KERNEL_VERSION: u32 = 7;
const KERNEL_MINOR_VERSION: u32 = 22;

/// `fuse_in_header`: len, opcode, unique, nodeid, uid, gid, pid, padding.
const IN_HEADER_LEN: usize = 40;
/// `fuse_out_header`: len, error, unique.
const OUT_HEADER_LEN: usize = 16;
/// `fuse_init_out` up to and including `max_write`.
const INIT_OUT_LEN: usize = 24;

const MAX_READ_AHEAD: u32 = 128 * 1024;
const MAX_BACKGROUND: u16 = 12;
const CONGESTION_THRESHOLD: u16 = 9;
/// Must stay below [`MAX_MESSAGE_SIZE`] with room for the request header.
const MAX_WRITE: u32 = (MAX_MESSAGE_SIZE - 4096) as u32;

pub struct EnosysOps;

impl SessionHooks for EnosysOps {
    fn on_mount_ready(&mut self, connection: &ConnectionInfo) {
        log::info!(
            "mounted at {}, answering every operation with ENOSYS",
            connection.mount_point.display()
        );
    }

    fn on_channel_message(&mut self, buffer: &[u8]) -> io::Result<Option<Vec<u8>>> {
        let Some(header) = InHeader::parse(buffer) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("truncated request of {} bytes", buffer.len()),
            ));
        };

        if header.opcode == FUSE_INIT {
            return Ok(Some(init_reply(&header, &buffer[IN_HEADER_LEN..])));
        }

        // the kernel never tracks these requests; answering one is an error
        if matches!(
            header.opcode,
            FUSE_FORGET | FUSE_INTERRUPT | FUSE_BATCH_FORGET
        ) {
            log::debug!("opcode {} expects no reply", header.opcode);
            return Ok(None);
        }

        log::debug!("opcode {} (unique {}): ENOSYS", header.opcode, header.unique);
        Ok(Some(error_reply(header.unique, libc::ENOSYS)))
    }
}

struct InHeader {
    opcode: u32,
    unique: u64,
}

impl InHeader {
    /// Fields are in host byte order, the kernel and the daemon being the
    /// same machine.
    fn parse(buffer: &[u8]) -> Option<Self> {
        if buffer.len() < IN_HEADER_LEN {
            return None;
        }
        Some(Self {
            opcode: u32::from_ne_bytes(buffer[4..8].try_into().ok()?),
            unique: u64::from_ne_bytes(buffer[8..16].try_into().ok()?),
        })
    }
}

fn out_header(payload_len: usize, error: i32, unique: u64) -> Vec<u8> {
    let mut reply = Vec::with_capacity(OUT_HEADER_LEN + payload_len);
    reply.extend_from_slice(&((OUT_HEADER_LEN + payload_len) as u32).to_ne_bytes());
    reply.extend_from_slice(&error.to_ne_bytes());
    reply.extend_from_slice(&unique.to_ne_bytes());
    reply
}

fn error_reply(unique: u64, errno: i32) -> Vec<u8> {
    out_header(0, -errno, unique)
}

/// Negotiate the protocol revision: our minor when the kernel is newer,
/// the kernel's when it is older.
fn init_reply(header: &InHeader, payload: &[u8]) -> Vec<u8> {
    let kernel_minor = payload
        .get(4..8)
        .and_then(|raw| raw.try_into().ok())
        .map(u32::from_ne_bytes)
        .unwrap_or(KERNEL_MINOR_VERSION);

    log::debug!("FUSE_INIT: kernel speaks 7.{kernel_minor}");

    let mut reply = out_header(INIT_OUT_LEN, 0, header.unique);
    reply.extend_from_slice(&KERNEL_VERSION.to_ne_bytes());
    reply.extend_from_slice(&kernel_minor.min(KERNEL_MINOR_VERSION).to_ne_bytes());
    reply.extend_from_slice(&MAX_READ_AHEAD.to_ne_bytes());
    reply.extend_from_slice(&0u32.to_ne_bytes()); // flags: no extensions
    reply.extend_from_slice(&MAX_BACKGROUND.to_ne_bytes());
    reply.extend_from_slice(&CONGESTION_THRESHOLD.to_ne_bytes());
    reply.extend_from_slice(&MAX_WRITE.to_ne_bytes());
    reply
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn request(opcode: u32, unique: u64, payload: &[u8]) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&((IN_HEADER_LEN + payload.len()) as u32).to_ne_bytes());
        buffer.extend_from_slice(&opcode.to_ne_bytes());
        buffer.extend_from_slice(&unique.to_ne_bytes());
        buffer.extend_from_slice(&[0u8; 24]); // nodeid, uid, gid, pid, padding
        buffer.extend_from_slice(payload);
        buffer
    }

    fn init_payload(major: u32, minor: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&major.to_ne_bytes());
        payload.extend_from_slice(&minor.to_ne_bytes());
        payload.extend_from_slice(&MAX_READ_AHEAD.to_ne_bytes());
        payload.extend_from_slice(&0u32.to_ne_bytes());
        payload
    }

    #[test]
    fn init_is_answered_with_a_negotiated_revision() {
        let reply = EnosysOps
            .on_channel_message(&request(FUSE_INIT, 1, &init_payload(7, 31)))
            .expect("init failed")
            .expect("init produced no reply");

        assert_eq!(reply.len(), OUT_HEADER_LEN + INIT_OUT_LEN);
        // header: total length, no error, matching unique
        assert_eq!(u32::from_ne_bytes(reply[0..4].try_into().unwrap()), 40);
        assert_eq!(i32::from_ne_bytes(reply[4..8].try_into().unwrap()), 0);
        assert_eq!(u64::from_ne_bytes(reply[8..16].try_into().unwrap()), 1);
        // negotiated down to our revision
        assert_eq!(u32::from_ne_bytes(reply[16..20].try_into().unwrap()), 7);
        assert_eq!(u32::from_ne_bytes(reply[20..24].try_into().unwrap()), 22);
    }

    #[test]
    fn older_kernel_revision_is_kept() {
        let reply = EnosysOps
            .on_channel_message(&request(FUSE_INIT, 2, &init_payload(7, 19)))
            .expect("init failed")
            .expect("init produced no reply");

        assert_eq!(u32::from_ne_bytes(reply[20..24].try_into().unwrap()), 19);
    }

    #[test]
    fn every_other_opcode_is_enosys() {
        // FUSE_LOOKUP
        let reply = EnosysOps
            .on_channel_message(&request(1, 7, &[]))
            .expect("dispatch failed")
            .expect("no reply produced");

        assert_eq!(reply.len(), OUT_HEADER_LEN);
        assert_eq!(u32::from_ne_bytes(reply[0..4].try_into().unwrap()), 16);
        assert_eq!(
            i32::from_ne_bytes(reply[4..8].try_into().unwrap()),
            -libc::ENOSYS
        );
        assert_eq!(u64::from_ne_bytes(reply[8..16].try_into().unwrap()), 7);
    }

    #[test]
    fn forget_and_interrupt_get_no_reply() {
        for opcode in [FUSE_FORGET, FUSE_INTERRUPT, FUSE_BATCH_FORGET] {
            let reply = EnosysOps
                .on_channel_message(&request(opcode, 9, &[]))
                .expect("dispatch failed");
            assert_eq!(reply, None);
        }
    }

    #[test]
    fn truncated_requests_are_an_error() {
        assert!(EnosysOps.on_channel_message(&[0u8; 12]).is_err());
    }
}
