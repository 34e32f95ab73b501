use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use crate::types::BridgeEvent;

/// Longest accepted command line, delimiter excluded. Anything longer is
/// discarded through its terminating newline and rejected, which keeps the
/// accumulation buffer bounded against a client that never sends a newline.
pub const MAX_LINE_BYTES: usize = 512;

const READ_CHUNK: usize = 256;

/// Outcome of a non-blocking read on a client link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRead {
    /// `n` bytes were placed at the start of the buffer.
    Data(usize),
    /// Nothing available right now.
    Empty,
    /// The peer closed the connection.
    Closed,
}

/// One attached client, as the session manager sees it.
pub trait ClientLink {
    fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<LinkRead>;
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Non-blocking source of inbound connections.
pub trait CommandListener {
    type Link: ClientLink;

    /// `None` when nobody is waiting.
    fn poll_accept(&mut self) -> io::Result<Option<Self::Link>>;
}

/// One line taken out of the session buffer, delimiter stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputLine {
    Complete(String),
    /// The line blew past [`MAX_LINE_BYTES`]; `length` is what was discarded.
    Oversized { length: usize },
}

struct Session<C> {
    link: C,
    peer: Option<SocketAddr>,
    lines: VecDeque<InputLine>,
    partial: Vec<u8>,
    discarding: usize,
    closed: bool,
}

impl<C: ClientLink> Session<C> {
    fn new(link: C) -> Self {
        let peer = link.peer_addr();
        Self {
            link,
            peer,
            lines: VecDeque::new(),
            partial: Vec::new(),
            discarding: 0,
            closed: false,
        }
    }

    fn ingest(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == b'\n' {
                if self.discarding > 0 {
                    self.lines.push_back(InputLine::Oversized {
                        length: self.discarding,
                    });
                    self.discarding = 0;
                } else {
                    let mut line = std::mem::take(&mut self.partial);
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    self.lines
                        .push_back(InputLine::Complete(String::from_utf8_lossy(&line).into_owned()));
                }
            } else if self.discarding > 0 {
                self.discarding += 1;
            } else {
                self.partial.push(byte);
                if self.partial.len() > MAX_LINE_BYTES {
                    self.discarding = self.partial.len();
                    self.partial.clear();
                }
            }
        }
    }
}

/// Owns the one command session permitted at a time.
///
/// Idle until a client connects, Active until that client goes away. A
/// connection attempt while Active is closed immediately; the active session
/// is never preempted.
pub struct SessionManager<L: CommandListener> {
    listener: L,
    session: Option<Session<L::Link>>,
}

impl<L: CommandListener> SessionManager<L> {
    pub fn new(listener: L) -> Self {
        Self {
            listener,
            session: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Attaches a waiting client if the slot is free, rejects it otherwise.
    /// Drains every pending attempt so rejected clients are not left queued.
    pub fn accept_pending(&mut self, events: &mut Vec<BridgeEvent>) {
        loop {
            match self.listener.poll_accept() {
                Ok(Some(link)) => {
                    let peer = link.peer_addr();
                    if self.session.is_some() {
                        // Dropping the link closes it; the active session wins.
                        events.push(BridgeEvent::SessionRejected { peer });
                    } else {
                        events.push(BridgeEvent::SessionOpened { peer });
                        self.session = Some(Session::new(link));
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    events.push(BridgeEvent::AcceptFailed {
                        error: err.to_string(),
                    });
                    break;
                }
            }
        }
    }

    /// Pulls everything currently readable into the line buffer. Returns
    /// once the link runs dry or closes.
    pub fn fill(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match session.link.poll_read(&mut chunk) {
                Ok(LinkRead::Data(n)) => session.ingest(&chunk[..n]),
                Ok(LinkRead::Empty) => break,
                Ok(LinkRead::Closed) | Err(_) => {
                    session.closed = true;
                    break;
                }
            }
        }
    }

    /// Next complete line in arrival order, if any. Lines received before a
    /// disconnect keep coming until the queue is empty.
    pub fn take_line(&mut self) -> Option<InputLine> {
        self.session.as_mut()?.lines.pop_front()
    }

    /// Writes a response to the attached client. A failed write marks the
    /// session closed; the next sweep releases it.
    pub fn respond(&mut self, response: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.closed {
            return;
        }
        if session.link.send(response.as_bytes()).is_err() {
            session.closed = true;
        }
    }

    /// Releases a closed session. Any partially-buffered line dies with it.
    pub fn sweep(&mut self, events: &mut Vec<BridgeEvent>) {
        if self
            .session
            .as_ref()
            .is_some_and(|session| session.closed && session.lines.is_empty())
        {
            if let Some(session) = self.session.take() {
                events.push(BridgeEvent::SessionClosed { peer: session.peer });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct FakeLinkState {
        incoming: VecDeque<u8>,
        written: Vec<u8>,
        closed: bool,
    }

    #[derive(Clone, Default)]
    struct FakeLink {
        state: Rc<RefCell<FakeLinkState>>,
    }

    impl FakeLink {
        fn push_input(&self, bytes: &[u8]) {
            self.state.borrow_mut().incoming.extend(bytes.iter().copied());
        }

        fn close(&self) {
            self.state.borrow_mut().closed = true;
        }

        fn written(&self) -> Vec<u8> {
            self.state.borrow().written.clone()
        }
    }

    impl ClientLink for FakeLink {
        fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<LinkRead> {
            let mut state = self.state.borrow_mut();
            if state.incoming.is_empty() {
                if state.closed {
                    return Ok(LinkRead::Closed);
                }
                return Ok(LinkRead::Empty);
            }
            let mut n = 0;
            while n < buf.len() {
                match state.incoming.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(LinkRead::Data(n))
        }

        fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            state.written.extend_from_slice(bytes);
            Ok(())
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            "127.0.0.1:50000".parse().ok()
        }
    }

    #[derive(Clone, Default)]
    struct FakeListener {
        pending: Rc<RefCell<VecDeque<FakeLink>>>,
    }

    impl FakeListener {
        fn push(&self, link: FakeLink) {
            self.pending.borrow_mut().push_back(link);
        }
    }

    impl CommandListener for FakeListener {
        type Link = FakeLink;

        fn poll_accept(&mut self) -> io::Result<Option<FakeLink>> {
            Ok(self.pending.borrow_mut().pop_front())
        }
    }

    fn manager_with_client() -> (SessionManager<FakeListener>, FakeListener, FakeLink) {
        let listener = FakeListener::default();
        let link = FakeLink::default();
        listener.push(link.clone());
        let mut manager = SessionManager::new(listener.clone());
        let mut events = Vec::new();
        manager.accept_pending(&mut events);
        assert!(manager.is_active());
        (manager, listener, link)
    }

    #[test]
    fn second_attempt_rejected_while_active() {
        let (mut manager, listener, _link) = manager_with_client();
        listener.push(FakeLink::default());

        let mut events = Vec::new();
        manager.accept_pending(&mut events);

        assert!(matches!(events[0], BridgeEvent::SessionRejected { .. }));
        assert!(manager.is_active());
    }

    #[test]
    fn lines_accumulate_across_partial_reads() {
        let (mut manager, _listener, link) = manager_with_client();

        link.push_input(b"o");
        manager.fill();
        assert_eq!(manager.take_line(), None);

        link.push_input(b"n\n");
        manager.fill();
        assert_eq!(
            manager.take_line(),
            Some(InputLine::Complete("on".to_string()))
        );
    }

    #[test]
    fn carriage_return_is_stripped_with_the_delimiter() {
        let (mut manager, _listener, link) = manager_with_client();

        link.push_input(b"on\r\n");
        manager.fill();

        assert_eq!(
            manager.take_line(),
            Some(InputLine::Complete("on".to_string()))
        );
    }

    #[test]
    fn oversized_line_is_discarded_not_split() {
        let (mut manager, _listener, link) = manager_with_client();

        let long = vec![b'a'; MAX_LINE_BYTES + 100];
        link.push_input(&long);
        link.push_input(b"\non\n");
        manager.fill();

        assert_eq!(
            manager.take_line(),
            Some(InputLine::Oversized {
                length: MAX_LINE_BYTES + 100
            })
        );
        assert_eq!(
            manager.take_line(),
            Some(InputLine::Complete("on".to_string()))
        );
    }

    #[test]
    fn disconnect_releases_the_slot_and_drops_the_partial_line() {
        let (mut manager, listener, link) = manager_with_client();

        link.push_input(b"on");
        link.close();
        manager.fill();
        assert_eq!(manager.take_line(), None);

        let mut events = Vec::new();
        manager.sweep(&mut events);
        assert!(matches!(events[0], BridgeEvent::SessionClosed { .. }));
        assert!(!manager.is_active());

        // The slot is usable again.
        listener.push(FakeLink::default());
        let mut events = Vec::new();
        manager.accept_pending(&mut events);
        assert!(matches!(events[0], BridgeEvent::SessionOpened { .. }));
    }

    #[test]
    fn complete_lines_survive_a_disconnect() {
        let (mut manager, _listener, link) = manager_with_client();

        link.push_input(b"on\n");
        link.close();
        manager.fill();

        // The line is still handed out; the sweep waits for the queue.
        let mut events = Vec::new();
        manager.sweep(&mut events);
        assert!(events.is_empty());
        assert_eq!(
            manager.take_line(),
            Some(InputLine::Complete("on".to_string()))
        );

        manager.sweep(&mut events);
        assert!(matches!(events[0], BridgeEvent::SessionClosed { .. }));
    }

    #[test]
    fn responses_reach_the_client_unframed() {
        let (mut manager, _listener, link) = manager_with_client();

        manager.respond("OK: on");

        assert_eq!(link.written(), b"OK: on");
    }
}
