//! Datagram value: a payload buffer, an ancillary control buffer, and an
//! optional peer address, matching exactly what `sendmsg(2)`/`recvmsg(2)`
//! read and write on a unix-domain socket — including `SCM_RIGHTS`
//! file-descriptor passing and credential ancillary records.

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::buffer::{Buffer, PAGE_SIZE};
use crate::error::{Error, Result};

/// One datagram: payload bytes, ancillary control bytes, and (for
/// unconnected sockets) the peer address the datagram came from or should
/// be sent to.
#[derive(Default, Clone)]
pub struct Message {
    pub payload: Buffer,
    pub control: Buffer,
    pub addr: Option<Vec<u8>>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one ancillary control record: `(level, type)` header plus
    /// `data`, padded to the platform's control-message alignment.
    pub fn push_control(&mut self, level: i32, cmsg_type: i32, data: &[u8]) -> Result<()> {
        let space = unsafe { libc::CMSG_SPACE(data.len() as u32) } as usize;
        let mut record = vec![0u8; space];
        unsafe {
            let hdr = record.as_mut_ptr() as *mut libc::cmsghdr;
            ptr::write(
                hdr,
                libc::cmsghdr {
                    cmsg_len: libc::CMSG_LEN(data.len() as u32) as _,
                    cmsg_level: level,
                    cmsg_type,
                },
            );
            let dst = libc::CMSG_DATA(hdr);
            ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        self.control.push(&record)
    }

    /// Walk the control buffer's cmsg records, yielding `(level, type, data)`
    /// for each.
    pub fn control_records(&self) -> Vec<(i32, i32, Vec<u8>)> {
        let raw = self.control.as_slice();
        if raw.is_empty() {
            return Vec::new();
        }
        // Build a throwaway msghdr purely to drive CMSG_FIRSTHDR/CMSG_NXTHDR,
        // matching how the platform itself expects to walk this buffer.
        let mut buf = raw.to_vec();
        let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
        msghdr.msg_control = buf.as_mut_ptr() as *mut _;
        msghdr.msg_controllen = buf.len();

        let mut out = Vec::new();
        unsafe {
            let mut hdr = libc::CMSG_FIRSTHDR(&msghdr);
            while !hdr.is_null() {
                let data_ptr = libc::CMSG_DATA(hdr);
                let data_offset = (data_ptr as usize) - (hdr as usize);
                let data_len = (*hdr).cmsg_len as usize - data_offset;
                let mut data = vec![0u8; data_len];
                ptr::copy_nonoverlapping(data_ptr, data.as_mut_ptr(), data_len);
                out.push(((*hdr).cmsg_level, (*hdr).cmsg_type, data));
                hdr = libc::CMSG_NXTHDR(&mut msghdr, hdr);
            }
        }
        out
    }

    /// Receive one datagram from `fd`, reserving up to `n` payload bytes
    /// and one page of ancillary capacity. Returns the message and the
    /// actual payload length. `Err(Error::Truncated)` if the datagram
    /// (payload or control data) did not fit.
    pub fn recv(fd: RawFd, n: usize) -> Result<(Message, usize)> {
        let mut payload = vec![0u8; n];
        let mut control = vec![0u8; PAGE_SIZE];
        let mut addr_storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();

        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr() as *mut _,
            iov_len: payload.len(),
        };
        let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
        msghdr.msg_name = addr_storage.as_mut_ptr() as *mut _;
        msghdr.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as _;
        msghdr.msg_iov = &mut iov;
        msghdr.msg_iovlen = 1;
        msghdr.msg_control = control.as_mut_ptr() as *mut _;
        msghdr.msg_controllen = control.len();

        let received = loop {
            let rc = unsafe { libc::recvmsg(fd, &mut msghdr, 0) };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::EINTR => continue,
                Some(code) if code == libc::EBADF => return Err(Error::BadFd),
                _ => return Err(Error::IoSystem(err)),
            }
        };

        if msghdr.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC) != 0 {
            return Err(Error::Truncated);
        }

        let mut message = Message::new();
        payload.truncate(received);
        message.payload.push(&payload)?;

        control.truncate(msghdr.msg_controllen as usize);
        if !control.is_empty() {
            message.control.push(&control)?;
        }

        if msghdr.msg_namelen > 0 {
            let addr_bytes = unsafe {
                std::slice::from_raw_parts(
                    addr_storage.as_ptr() as *const u8,
                    msghdr.msg_namelen as usize,
                )
            };
            message.addr = Some(addr_bytes.to_vec());
        }

        Ok((message, received))
    }

    /// Transmit the message once. Uses `self.addr` as destination when set
    /// (unconnected sockets); a short write is treated as an error since
    /// datagrams are never partially delivered.
    pub fn send(&self, fd: RawFd) -> Result<()> {
        let payload = self.payload.as_slice();
        let control = self.control.as_slice();

        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut _,
            iov_len: payload.len(),
        };
        let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
        if let Some(addr) = &self.addr {
            msghdr.msg_name = addr.as_ptr() as *mut _;
            msghdr.msg_namelen = addr.len() as _;
        }
        msghdr.msg_iov = &mut iov;
        msghdr.msg_iovlen = 1;
        if !control.is_empty() {
            msghdr.msg_control = control.as_ptr() as *mut _;
            msghdr.msg_controllen = control.len();
        }

        let sent = loop {
            let rc = unsafe { libc::sendmsg(fd, &msghdr, 0) };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::EINTR => continue,
                Some(code) if code == libc::EBADF => return Err(Error::BadFd),
                _ => return Err(Error::IoSystem(err)),
            }
        };

        if sent != payload.len() {
            return Err(Error::IoSystem(io::Error::new(
                io::ErrorKind::WriteZero,
                "short datagram send",
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn send_recv_round_trip_without_control_data() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let mut msg = Message::new();
        msg.payload.push(b"hello").unwrap();
        msg.send(a.as_raw_fd()).unwrap();

        let (received, n) = Message::recv(b.as_raw_fd(), 64).unwrap();
        assert_eq!(n, 5);
        assert_eq!(received.payload.as_slice(), b"hello");
    }

    #[test]
    fn send_recv_with_scm_rights_control_data() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let passed = std::fs::File::open("/dev/null").unwrap();
        let fd_bytes = (passed.as_raw_fd() as RawFd).to_ne_bytes();

        let mut msg = Message::new();
        msg.payload.push(b"fd incoming").unwrap();
        msg.push_control(libc::SOL_SOCKET, libc::SCM_RIGHTS, &fd_bytes)
            .unwrap();
        msg.send(a.as_raw_fd()).unwrap();

        let (received, n) = Message::recv(b.as_raw_fd(), 64).unwrap();
        assert_eq!(n, 11);
        let records = received.control_records();
        assert_eq!(records.len(), 1);
        let (level, ty, data) = &records[0];
        assert_eq!(*level, libc::SOL_SOCKET);
        assert_eq!(*ty, libc::SCM_RIGHTS);
        assert_eq!(data.len(), std::mem::size_of::<RawFd>());
    }

    #[test]
    fn recv_reports_truncation() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let mut msg = Message::new();
        msg.payload.push(&vec![0u8; 256]).unwrap();
        msg.send(a.as_raw_fd()).unwrap();

        let err = Message::recv(b.as_raw_fd(), 4).unwrap_err();
        assert!(matches!(err, Error::Truncated));
    }
}
