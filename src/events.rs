//! The kernel process-event channel.
//!
//! The kernel publishes fork/exec/setuid/exit notifications through the
//! netlink connector. This module owns the wire format: the subscribe
//! datagram sent once after bind, and the parsing of received frames
//! (netlink header, connector header, event payload) into [`ProcEvent`]
//! values. Frame parsing is pure so it can be exercised without a
//! kernel.

use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::*;

const CN_IDX_PROC: u32 = 1;
const CN_VAL_PROC: u32 = 1;
const PROC_CN_MCAST_LISTEN: u32 = 1;

const NLMSG_HDRLEN: usize = 16;
const CN_MSG_LEN: usize = 20;

const PROC_EVENT_FORK: u32 = 0x0000_0001;
const PROC_EVENT_EXEC: u32 = 0x0000_0002;
const PROC_EVENT_UID: u32 = 0x0000_0004;
const PROC_EVENT_GID: u32 = 0x0000_0040;
const PROC_EVENT_EXIT: u32 = 0x8000_0000;

/// One decoded process event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcEvent {
    Fork {
        parent_pid: libc::pid_t,
        child_pid: libc::pid_t,
        /// Kernel monotonic timestamp of the fork.
        timestamp_ns: u64,
    },
    Exec {
        pid: libc::pid_t,
    },
    Uid {
        pid: libc::pid_t,
        euid: u32,
    },
    Gid {
        pid: libc::pid_t,
        egid: u32,
    },
    Exit {
        pid: libc::pid_t,
    },
}

fn u16_at(buf: &[u8], off: usize) -> Option<u16> {
    buf.get(off..off + 2)
        .map(|b| u16::from_ne_bytes([b[0], b[1]]))
}

fn u32_at(buf: &[u8], off: usize) -> Option<u32> {
    buf.get(off..off + 4)
        .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
}

fn i32_at(buf: &[u8], off: usize) -> Option<i32> {
    u32_at(buf, off).map(|v| v as i32)
}

fn u64_at(buf: &[u8], off: usize) -> Option<u64> {
    buf.get(off..off + 8).map(|b| {
        u64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    })
}

/// Decode one `proc_event` payload: a 16-byte header (what, cpu,
/// timestamp) followed by the per-type data.
pub(crate) fn parse_event(data: &[u8]) -> Option<ProcEvent> {
    let what = u32_at(data, 0)?;
    let timestamp_ns = u64_at(data, 8)?;
    let body = 16;

    match what {
        PROC_EVENT_FORK => Some(ProcEvent::Fork {
            parent_pid: i32_at(data, body)?,
            child_pid: i32_at(data, body + 8)?,
            timestamp_ns,
        }),
        PROC_EVENT_EXEC => Some(ProcEvent::Exec {
            pid: i32_at(data, body)?,
        }),
        PROC_EVENT_UID => Some(ProcEvent::Uid {
            pid: i32_at(data, body)?,
            euid: u32_at(data, body + 12)?,
        }),
        PROC_EVENT_GID => Some(ProcEvent::Gid {
            pid: i32_at(data, body)?,
            egid: u32_at(data, body + 12)?,
        }),
        PROC_EVENT_EXIT => Some(ProcEvent::Exit {
            pid: i32_at(data, body)?,
        }),
        _ => None,
    }
}

/// Walk a received datagram: zero or more netlink messages, each
/// wrapping a connector message wrapping a proc_event.
pub(crate) fn parse_frames(buf: &[u8]) -> Vec<ProcEvent> {
    let mut events = Vec::new();
    let mut offset = 0usize;

    while offset + NLMSG_HDRLEN <= buf.len() {
        let msg_len = match u32_at(buf, offset) {
            Some(len) => len as usize,
            None => break,
        };
        if msg_len < NLMSG_HDRLEN || offset + msg_len > buf.len() {
            break;
        }
        let msg_type = u16_at(buf, offset + 4).unwrap_or(0) as i32;

        match msg_type {
            libc::NLMSG_NOOP => {}
            libc::NLMSG_ERROR | libc::NLMSG_OVERRUN => break,
            _ => {
                let payload = &buf[offset + NLMSG_HDRLEN..offset + msg_len];
                if payload.len() >= CN_MSG_LEN {
                    let idx = u32_at(payload, 0).unwrap_or(0);
                    let val = u32_at(payload, 4).unwrap_or(0);
                    let data_len = u16_at(payload, 16).unwrap_or(0) as usize;
                    let data = &payload[CN_MSG_LEN..];
                    if idx == CN_IDX_PROC && val == CN_VAL_PROC && data.len() >= data_len {
                        if let Some(event) = parse_event(&data[..data_len]) {
                            events.push(event);
                        }
                    }
                }
            }
        }

        // Netlink messages are 4-byte aligned.
        offset += (msg_len + 3) & !3;
    }

    events
}

/// The single control datagram that subscribes this socket to the
/// process-event multicast group.
pub(crate) fn listen_message(pid: u32) -> Vec<u8> {
    let total = NLMSG_HDRLEN + CN_MSG_LEN + 4;
    let mut buf = Vec::with_capacity(total);

    // nlmsghdr
    buf.extend_from_slice(&(total as u32).to_ne_bytes());
    buf.extend_from_slice(&(libc::NLMSG_DONE as u16).to_ne_bytes());
    buf.extend_from_slice(&0u16.to_ne_bytes()); // flags
    buf.extend_from_slice(&0u32.to_ne_bytes()); // seq
    buf.extend_from_slice(&pid.to_ne_bytes());

    // cn_msg
    buf.extend_from_slice(&CN_IDX_PROC.to_ne_bytes());
    buf.extend_from_slice(&CN_VAL_PROC.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // seq
    buf.extend_from_slice(&0u32.to_ne_bytes()); // ack
    buf.extend_from_slice(&4u16.to_ne_bytes()); // len
    buf.extend_from_slice(&0u16.to_ne_bytes()); // flags

    // proc_cn_mcast_op
    buf.extend_from_slice(&PROC_CN_MCAST_LISTEN.to_ne_bytes());

    buf
}

/// A bound and subscribed netlink-connector socket.
pub struct EventSocket {
    fd: RawFd,
}

impl EventSocket {
    /// Open the datagram channel, bind to the process-event multicast
    /// group, and send the listen control message.
    pub fn open() -> Result<EventSocket> {
        let fd = unsafe {
            libc::socket(
                libc::PF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_CONNECTOR,
            )
        };
        if fd < 0 {
            error!("error opening netlink socket");
            return Err(Error::from_os(std::io::Error::last_os_error()));
        }
        let socket = EventSocket { fd };

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = CN_IDX_PROC;
        addr.nl_pid = unsafe { libc::getpid() } as u32;

        let rc = unsafe {
            libc::bind(
                socket.fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            error!("error binding netlink socket");
            return Err(Error::from_os(std::io::Error::last_os_error()));
        }

        debug!("sending proc connector: PROC_CN_MCAST_LISTEN");
        let msg = listen_message(addr.nl_pid);
        let sent = unsafe {
            libc::send(socket.fd, msg.as_ptr() as *const libc::c_void, msg.len(), 0)
        };
        if sent != msg.len() as isize {
            error!("failed to send netlink listen message");
            return Err(Error::from_os(std::io::Error::last_os_error()));
        }

        Ok(socket)
    }

    /// Receive one datagram and decode its events. Datagrams from
    /// senders other than the kernel are discarded.
    pub fn receive(&self, buf: &mut [u8]) -> Result<Vec<ProcEvent>> {
        let mut from: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        let mut from_len = std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;

        let received = unsafe {
            libc::recvfrom(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut from as *mut libc::sockaddr_nl as *mut libc::sockaddr,
                &mut from_len,
            )
        };
        if received < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOBUFS) {
                error!("netlink buffer full, message dropped");
                return Ok(Vec::new());
            }
            return Err(Error::from_os(err));
        }

        if from.nl_groups != CN_IDX_PROC || from.nl_pid != 0 {
            return Ok(Vec::new());
        }

        Ok(parse_frames(&buf[..received as usize]))
    }
}

impl AsRawFd for EventSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a frame the way the kernel does: nlmsghdr + cn_msg +
    /// proc_event.
    fn frame(what: u32, timestamp_ns: u64, fields: &[i32]) -> Vec<u8> {
        let mut event = Vec::new();
        event.extend_from_slice(&what.to_ne_bytes());
        event.extend_from_slice(&0u32.to_ne_bytes()); // cpu
        event.extend_from_slice(&timestamp_ns.to_ne_bytes());
        for field in fields {
            event.extend_from_slice(&field.to_ne_bytes());
        }

        let total = NLMSG_HDRLEN + CN_MSG_LEN + event.len();
        let mut buf = Vec::new();
        buf.extend_from_slice(&(total as u32).to_ne_bytes());
        buf.extend_from_slice(&(libc::NLMSG_DONE as u16).to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());

        buf.extend_from_slice(&CN_IDX_PROC.to_ne_bytes());
        buf.extend_from_slice(&CN_VAL_PROC.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&(event.len() as u16).to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());

        buf.extend_from_slice(&event);
        buf
    }

    #[test]
    fn fork_event_round_trips() {
        let buf = frame(PROC_EVENT_FORK, 777, &[100, 100, 101, 101]);
        let events = parse_frames(&buf);
        assert_eq!(
            events,
            vec![ProcEvent::Fork {
                parent_pid: 100,
                child_pid: 101,
                timestamp_ns: 777,
            }]
        );
    }

    #[test]
    fn uid_event_extracts_the_effective_id() {
        // id data: process_pid, process_tgid, ruid, euid
        let buf = frame(PROC_EVENT_UID, 1, &[55, 55, 1000, 1001]);
        assert_eq!(
            parse_frames(&buf),
            vec![ProcEvent::Uid {
                pid: 55,
                euid: 1001,
            }]
        );
    }

    #[test]
    fn exit_and_exec_events_carry_the_pid() {
        let buf = frame(PROC_EVENT_EXIT, 2, &[99, 99, 0, 15]);
        assert_eq!(parse_frames(&buf), vec![ProcEvent::Exit { pid: 99 }]);

        let buf = frame(PROC_EVENT_EXEC, 3, &[42, 42]);
        assert_eq!(parse_frames(&buf), vec![ProcEvent::Exec { pid: 42 }]);
    }

    #[test]
    fn unknown_and_truncated_frames_are_dropped() {
        let buf = frame(0x2000, 1, &[1, 2]);
        assert!(parse_frames(&buf).is_empty());

        let buf = frame(PROC_EVENT_FORK, 1, &[100, 100, 101, 101]);
        assert!(parse_frames(&buf[..10]).is_empty());
    }

    #[test]
    fn multiple_messages_in_one_datagram() {
        let mut buf = frame(PROC_EVENT_EXEC, 1, &[10, 10]);
        buf.extend_from_slice(&frame(PROC_EVENT_EXIT, 2, &[11, 11, 0, 0]));
        let events = parse_frames(&buf);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn listen_message_layout() {
        let msg = listen_message(1234);
        assert_eq!(msg.len(), 40);
        assert_eq!(u32_at(&msg, 0), Some(40));
        assert_eq!(u16_at(&msg, 4), Some(libc::NLMSG_DONE as u16));
        assert_eq!(u32_at(&msg, 12), Some(1234));
        // connector id
        assert_eq!(u32_at(&msg, 16), Some(CN_IDX_PROC));
        assert_eq!(u32_at(&msg, 20), Some(CN_VAL_PROC));
        // mcast op
        assert_eq!(u32_at(&msg, 36), Some(PROC_CN_MCAST_LISTEN));
    }
}
