use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;

use irbridge_common::session::{ClientLink, CommandListener, LinkRead};

/// Non-blocking TCP listener feeding the session manager.
pub struct TcpCommandListener {
    listener: TcpListener,
}

impl TcpCommandListener {
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl CommandListener for TcpCommandListener {
    type Link = TcpClientLink;

    fn poll_accept(&mut self) -> io::Result<Option<TcpClientLink>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                let _ = stream.set_nodelay(true);
                Ok(Some(TcpClientLink { stream, peer }))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

pub struct TcpClientLink {
    stream: TcpStream,
    peer: SocketAddr,
}

impl ClientLink for TcpClientLink {
    fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<LinkRead> {
        match self.stream.read(buf) {
            Ok(0) => Ok(LinkRead::Closed),
            Ok(n) => Ok(LinkRead::Data(n)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(LinkRead::Empty),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(LinkRead::Empty),
            Err(err) => Err(err),
        }
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            match self.stream.write(remaining) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => remaining = &remaining[n..],
                // Responses are a handful of bytes; yielding until the socket
                // drains keeps the cooperative loop free of a write queue.
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::yield_now(),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}
