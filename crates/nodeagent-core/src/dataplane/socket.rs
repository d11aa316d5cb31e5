//! Unix `SOCK_SEQPACKET` sockets driven by the tokio reactor.
//!
//! Seqpacket keeps datagram boundaries on a connected stream, which the
//! dataplane protocol relies on: one `recvmsg` is exactly one message. Each
//! send may carry a single descriptor as an `SCM_RIGHTS` attachment.

#![allow(unsafe_code)]

use crate::config::ListenerConfig;
use crate::error::{NodeAgentError, Result};
use nix::sys::socket::{
    accept4, bind, connect, listen, recvmsg, sendmsg, socket, socketpair, AddressFamily, Backlog,
    ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

/// Most descriptors accepted on a single datagram.
const MAX_FDS_PER_MESSAGE: usize = 1;

fn socket_flags() -> SockFlag {
    SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC
}

/// Listening seqpacket socket bound to a filesystem path.
///
/// The socket file is removed when the listener is dropped.
#[derive(Debug)]
pub struct SeqPacketListener {
    fd: AsyncFd<OwnedFd>,
    path: PathBuf,
}

impl SeqPacketListener {
    /// Bind and listen on `path`.
    ///
    /// A socket file left over from a previous run is removed first. Any other
    /// failure is a configuration error.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(NodeAgentError::Config {
                message: "dataplane socket path cannot be empty".to_string(),
            });
        }

        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(NodeAgentError::Config {
                    message: format!("failed to remove unix://{}: {}", path.display(), e),
                })
            }
        }

        let config_err = |what: &str, err: nix::errno::Errno| NodeAgentError::Config {
            message: format!("failed to {} unix://{}: {}", what, path.display(), err),
        };

        let fd = socket(AddressFamily::Unix, SockType::SeqPacket, socket_flags(), None)
            .map_err(|e| config_err("create", e))?;
        let addr = UnixAddr::new(path).map_err(|e| config_err("resolve", e))?;
        bind(fd.as_raw_fd(), &addr).map_err(|e| config_err("bind", e))?;
        let backlog =
            Backlog::new(ListenerConfig::LISTEN_BACKLOG).map_err(|e| config_err("listen", e))?;
        listen(&fd, backlog).map_err(|e| config_err("listen", e))?;

        let fd = AsyncFd::new(fd).map_err(|e| NodeAgentError::Config {
            message: format!("failed to register listener: {}", e),
        })?;

        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for and accept one connection.
    pub async fn accept(&self) -> Result<SeqPacketStream> {
        loop {
            let mut guard = self
                .fd
                .readable()
                .await
                .map_err(|e| NodeAgentError::io_with_context(e, "accept"))?;

            let accepted = guard.try_io(|inner| {
                accept4(inner.get_ref().as_raw_fd(), socket_flags()).map_err(io::Error::from)
            });
            match accepted {
                Ok(Ok(raw)) => {
                    // SAFETY: accept4 returned a new descriptor that nothing else owns.
                    let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                    return SeqPacketStream::from_owned(owned);
                }
                Ok(Err(e)) => return Err(NodeAgentError::io_with_context(e, "accept")),
                Err(_would_block) => continue,
            }
        }
    }
}

impl Drop for SeqPacketListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove socket {}: {}", self.path.display(), e);
            }
        }
    }
}

/// One datagram read from a [`SeqPacketStream`].
#[derive(Debug)]
pub struct Datagram {
    /// Payload length within the caller's buffer.
    pub len: usize,
    /// Descriptors attached to the datagram.
    pub fds: Vec<OwnedFd>,
}

/// Connected seqpacket socket.
#[derive(Debug)]
pub struct SeqPacketStream {
    fd: AsyncFd<OwnedFd>,
}

impl SeqPacketStream {
    fn from_owned(fd: OwnedFd) -> Result<Self> {
        let fd = AsyncFd::new(fd).map_err(|e| NodeAgentError::io_with_context(e, "register socket"))?;
        Ok(Self { fd })
    }

    /// Connect to a listening socket at `path`.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let fd = socket(AddressFamily::Unix, SockType::SeqPacket, socket_flags(), None)?;
        let addr = UnixAddr::new(path)?;
        connect(fd.as_raw_fd(), &addr).map_err(|e| {
            NodeAgentError::io_with_context(e.into(), format!("connect unix://{}", path.display()))
        })?;
        Self::from_owned(fd)
    }

    /// Create a connected pair.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = socketpair(AddressFamily::Unix, SockType::SeqPacket, None, socket_flags())?;
        Ok((Self::from_owned(a)?, Self::from_owned(b)?))
    }

    /// Send one datagram, optionally attaching `fd`.
    pub async fn send(&self, payload: &[u8], fd: Option<BorrowedFd<'_>>) -> Result<()> {
        let fds: Vec<RawFd> = fd.iter().map(|fd| fd.as_raw_fd()).collect();

        loop {
            let mut guard = self
                .fd
                .writable()
                .await
                .map_err(|e| NodeAgentError::io_with_context(e, "send"))?;

            let sent = guard.try_io(|inner| {
                let iov = [IoSlice::new(payload)];
                let rights = [ControlMessage::ScmRights(&fds)];
                let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };
                sendmsg::<()>(
                    inner.get_ref().as_raw_fd(),
                    &iov,
                    cmsgs,
                    MsgFlags::MSG_NOSIGNAL,
                    None,
                )
                .map_err(io::Error::from)
            });
            match sent {
                Ok(Ok(n)) if n == payload.len() => return Ok(()),
                Ok(Ok(n)) => {
                    return Err(NodeAgentError::Io {
                        context: "send".to_string(),
                        message: format!("short write: {} of {} bytes", n, payload.len()),
                        source: None,
                    })
                }
                Ok(Err(e)) => return Err(NodeAgentError::io_with_context(e, "send")),
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one datagram into `buf`.
    ///
    /// Returns `None` when the peer has closed the connection. A datagram
    /// longer than `buf`, or one whose attachments did not fit, is an error.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<Option<Datagram>> {
        loop {
            let mut guard = self
                .fd
                .readable()
                .await
                .map_err(|e| NodeAgentError::io_with_context(e, "recv"))?;

            let received = guard.try_io(|inner| recv_datagram(inner.get_ref().as_raw_fd(), buf));
            match received {
                Ok(Ok((len, flags, fds))) => {
                    if flags.contains(MsgFlags::MSG_TRUNC) {
                        return Err(NodeAgentError::Truncated { what: "message" });
                    }
                    if flags.contains(MsgFlags::MSG_CTRUNC) {
                        return Err(NodeAgentError::Truncated {
                            what: "control message",
                        });
                    }
                    if len == 0 && fds.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(Datagram { len, fds }));
                }
                Ok(Err(e)) => return Err(NodeAgentError::io_with_context(e, "recv")),
                Err(_would_block) => continue,
            }
        }
    }
}

fn recv_datagram(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, MsgFlags, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_MESSAGE]);
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::MSG_CMSG_CLOEXEC)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for raw in received {
                // SAFETY: SCM_RIGHTS installs fresh descriptors in this process
                // that nothing else owns yet.
                fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }
    Ok((msg.bytes, msg.flags, fds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, Write};
    use std::os::fd::AsFd;

    #[tokio::test]
    async fn test_pair_preserves_datagram_boundaries() {
        let (a, b) = SeqPacketStream::pair().unwrap();
        a.send(b"first", None).await.unwrap();
        a.send(b"second", None).await.unwrap();

        let mut buf = [0u8; 64];
        let first = b.recv(&mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..first.len], b"first");
        let second = b.recv(&mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..second.len], b"second");
    }

    #[tokio::test]
    async fn test_descriptor_is_passed() {
        let (a, b) = SeqPacketStream::pair().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"netns").unwrap();

        a.send(b"add", Some(file.as_fd())).await.unwrap();

        let mut buf = [0u8; 64];
        let datagram = b.recv(&mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..datagram.len], b"add");
        assert_eq!(datagram.fds.len(), 1);

        // The received descriptor refers to the same open file.
        let mut received = std::fs::File::from(datagram.fds.into_iter().next().unwrap());
        received.rewind().unwrap();
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "netns");
    }

    #[tokio::test]
    async fn test_oversized_datagram_is_truncation_error() {
        let (a, b) = SeqPacketStream::pair().unwrap();
        a.send(&[7u8; 32], None).await.unwrap();

        let mut buf = [0u8; 8];
        let result = b.recv(&mut buf).await;
        assert!(matches!(
            result,
            Err(NodeAgentError::Truncated { what: "message" })
        ));
    }

    #[tokio::test]
    async fn test_peer_close_is_eof() {
        let (a, b) = SeqPacketStream::pair().unwrap();
        drop(a);

        let mut buf = [0u8; 8];
        assert!(b.recv(&mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listener_accepts_and_removes_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dp.sock");
        std::fs::write(&path, b"stale").unwrap();

        let listener = SeqPacketListener::bind(&path).unwrap();
        let client = SeqPacketStream::connect(&path).unwrap();
        let server = listener.accept().await.unwrap();

        client.send(b"hello", None).await.unwrap();
        let mut buf = [0u8; 16];
        let datagram = server.recv(&mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..datagram.len], b"hello");

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_bind_rejects_empty_path() {
        assert!(matches!(
            SeqPacketListener::bind(""),
            Err(NodeAgentError::Config { .. })
        ));
    }
}
