use thiserror::Error;

use crate::command::{CommandInterpreter, CommandResult, REJECTION};
use crate::session::{CommandListener, InputLine, SessionManager};
use crate::transport::{IrReceive, IrTransmit, TransportError};
use crate::types::BridgeEvent;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Transmit failures are fatal; the device cannot do its one job.
    #[error(transparent)]
    Transmit(#[from] TransportError),
}

/// One cooperative scheduling unit: connection accept, input drain, receiver
/// poll. `poll_once` never blocks beyond an in-flight IR transmission.
pub struct Bridge<L: CommandListener, T: IrTransmit, R: IrReceive> {
    sessions: SessionManager<L>,
    interpreter: CommandInterpreter,
    transmitter: T,
    receiver: Option<R>,
}

impl<L, T, R> Bridge<L, T, R>
where
    L: CommandListener,
    T: IrTransmit,
    R: IrReceive,
{
    pub fn new(
        listener: L,
        interpreter: CommandInterpreter,
        transmitter: T,
        receiver: Option<R>,
    ) -> Self {
        Self {
            sessions: SessionManager::new(listener),
            interpreter,
            transmitter,
            receiver,
        }
    }

    pub fn is_session_active(&self) -> bool {
        self.sessions.is_active()
    }

    /// Runs one poll-loop iteration and reports what happened. Commands are
    /// processed strictly in arrival order, one at a time.
    pub fn poll_once(&mut self) -> Result<Vec<BridgeEvent>, BridgeError> {
        let mut events = Vec::new();
        self.sessions.accept_pending(&mut events);
        self.drain_input(&mut events)?;
        self.poll_receiver(&mut events);
        Ok(events)
    }

    fn drain_input(&mut self, events: &mut Vec<BridgeEvent>) -> Result<(), BridgeError> {
        self.sessions.fill();
        while let Some(line) = self.sessions.take_line() {
            match line {
                InputLine::Complete(line) => {
                    let result = self.interpreter.handle(&line, &mut self.transmitter)?;
                    events.push(match &result {
                        CommandResult::Accepted(name) => BridgeEvent::CommandAccepted {
                            name: name.clone(),
                        },
                        CommandResult::Rejected(_) => BridgeEvent::CommandRejected {
                            input: line.trim().to_string(),
                        },
                    });
                    self.sessions.respond(&result.render());
                }
                InputLine::Oversized { length } => {
                    events.push(BridgeEvent::OversizedLineDropped { length });
                    self.sessions.respond(REJECTION);
                }
            }
        }
        self.sessions.sweep(events);
        Ok(())
    }

    fn poll_receiver(&mut self, events: &mut Vec<BridgeEvent>) {
        let Some(receiver) = self.receiver.as_mut() else {
            return;
        };
        loop {
            match receiver.poll_received() {
                Ok(Some(signal)) => events.push(BridgeEvent::SignalReceived(signal)),
                Ok(None) => break,
                Err(err) => {
                    events.push(BridgeEvent::ReceiveFailed {
                        error: err.to_string(),
                    });
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io;
    use std::net::SocketAddr;
    use std::rc::Rc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::session::{ClientLink, LinkRead, MAX_LINE_BYTES};
    use crate::signal::{RawPulseSequence, SignalLibrary};
    use crate::transport::{DecodedSignal, DisabledReceiver};

    #[derive(Default)]
    struct FakeLinkState {
        incoming: VecDeque<u8>,
        written: Vec<u8>,
        closed: bool,
    }

    #[derive(Clone)]
    struct FakeLink {
        state: Rc<RefCell<FakeLinkState>>,
        peer: SocketAddr,
    }

    impl FakeLink {
        fn new(port: u16) -> Self {
            Self {
                state: Rc::default(),
                peer: SocketAddr::from(([127, 0, 0, 1], port)),
            }
        }

        fn push_input(&self, bytes: &[u8]) {
            self.state.borrow_mut().incoming.extend(bytes.iter().copied());
        }

        fn close(&self) {
            self.state.borrow_mut().closed = true;
        }

        fn written(&self) -> String {
            String::from_utf8(self.state.borrow().written.clone()).unwrap()
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
            Some(self.peer)
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

    #[derive(Clone, Default)]
    struct RecordingIr {
        sent: Rc<RefCell<Vec<RawPulseSequence>>>,
    }

    impl RecordingIr {
        fn sent(&self) -> Vec<RawPulseSequence> {
            self.sent.borrow().clone()
        }
    }

    impl IrTransmit for RecordingIr {
        fn transmit(&mut self, sequence: &RawPulseSequence) -> Result<(), TransportError> {
            self.sent.borrow_mut().push(sequence.clone());
            Ok(())
        }
    }

    struct ScriptedReceiver {
        pending: VecDeque<DecodedSignal>,
    }

    impl IrReceive for ScriptedReceiver {
        fn poll_received(&mut self) -> Result<Option<DecodedSignal>, TransportError> {
            Ok(self.pending.pop_front())
        }
    }

    fn bridge(
        receiver: Option<ScriptedReceiver>,
    ) -> (
        Bridge<FakeListener, RecordingIr, ScriptedReceiver>,
        FakeListener,
        RecordingIr,
    ) {
        let listener = FakeListener::default();
        let ir = RecordingIr::default();
        let bridge = Bridge::new(
            listener.clone(),
            CommandInterpreter::new(SignalLibrary::builtin()),
            ir.clone(),
            receiver,
        );
        (bridge, listener, ir)
    }

    fn connected_client(
        bridge: &mut Bridge<FakeListener, RecordingIr, ScriptedReceiver>,
        listener: &FakeListener,
        port: u16,
    ) -> FakeLink {
        let link = FakeLink::new(port);
        listener.push(link.clone());
        let events = bridge.poll_once().unwrap();
        assert!(events
            .iter()
            .any(|event| matches!(event, BridgeEvent::SessionOpened { .. })));
        link
    }

    #[test]
    fn recognized_command_transmits_and_responds() {
        let (mut bridge, listener, ir) = bridge(None);
        let client = connected_client(&mut bridge, &listener, 4001);

        client.push_input(b"on\n");
        let events = bridge.poll_once().unwrap();

        assert_eq!(
            events,
            vec![BridgeEvent::CommandAccepted {
                name: "on".to_string()
            }]
        );
        let sent = ir.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], *SignalLibrary::builtin().lookup("on").unwrap());
        assert_eq!(client.written(), "OK: on");
    }

    #[test]
    fn unrecognized_command_rejected_without_transmission() {
        let (mut bridge, listener, ir) = bridge(None);
        let client = connected_client(&mut bridge, &listener, 4002);

        client.push_input(b"ON\n");
        let events = bridge.poll_once().unwrap();

        assert_eq!(
            events,
            vec![BridgeEvent::CommandRejected {
                input: "ON".to_string()
            }]
        );
        assert!(ir.sent().is_empty());
        assert_eq!(client.written(), "Invalid command");
    }

    #[test]
    fn empty_line_is_rejected() {
        let (mut bridge, listener, ir) = bridge(None);
        let client = connected_client(&mut bridge, &listener, 4003);

        client.push_input(b"\n");
        let events = bridge.poll_once().unwrap();

        assert!(matches!(events[0], BridgeEvent::CommandRejected { .. }));
        assert!(ir.sent().is_empty());
    }

    #[test]
    fn whitespace_around_a_command_is_tolerated() {
        let (mut bridge, listener, ir) = bridge(None);
        let client = connected_client(&mut bridge, &listener, 4004);

        client.push_input(b"  on  \n");
        let events = bridge.poll_once().unwrap();

        assert_eq!(
            events,
            vec![BridgeEvent::CommandAccepted {
                name: "on".to_string()
            }]
        );
        assert_eq!(ir.sent().len(), 1);
    }

    #[test]
    fn repeated_commands_are_never_coalesced() {
        let (mut bridge, listener, ir) = bridge(None);
        let client = connected_client(&mut bridge, &listener, 4005);

        client.push_input(b"on\non\n");
        let events = bridge.poll_once().unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(ir.sent().len(), 2);
        assert_eq!(client.written(), "OK: onOK: on");
    }

    #[test]
    fn second_client_is_rejected_and_the_first_keeps_working() {
        let (mut bridge, listener, ir) = bridge(None);
        let first = connected_client(&mut bridge, &listener, 4006);

        listener.push(FakeLink::new(4007));
        let events = bridge.poll_once().unwrap();
        assert!(events
            .iter()
            .any(|event| matches!(event, BridgeEvent::SessionRejected { .. })));

        first.push_input(b"on\n");
        let events = bridge.poll_once().unwrap();
        assert!(events
            .iter()
            .any(|event| matches!(event, BridgeEvent::CommandAccepted { .. })));
        assert_eq!(ir.sent().len(), 1);
        assert_eq!(first.written(), "OK: on");
    }

    #[test]
    fn disconnect_frees_the_slot_for_the_next_client() {
        let (mut bridge, listener, _ir) = bridge(None);
        let first = connected_client(&mut bridge, &listener, 4008);

        first.close();
        let events = bridge.poll_once().unwrap();
        assert!(events
            .iter()
            .any(|event| matches!(event, BridgeEvent::SessionClosed { .. })));
        assert!(!bridge.is_session_active());

        let second = connected_client(&mut bridge, &listener, 4009);
        second.push_input(b"on\n");
        let events = bridge.poll_once().unwrap();
        assert!(events
            .iter()
            .any(|event| matches!(event, BridgeEvent::CommandAccepted { .. })));
    }

    #[test]
    fn command_received_before_a_disconnect_still_fires() {
        let (mut bridge, listener, ir) = bridge(None);
        let client = connected_client(&mut bridge, &listener, 4010);

        client.push_input(b"on\n");
        client.close();
        let events = bridge.poll_once().unwrap();

        assert_eq!(
            events,
            vec![
                BridgeEvent::CommandAccepted {
                    name: "on".to_string()
                },
                BridgeEvent::SessionClosed {
                    peer: client.peer_addr()
                },
            ]
        );
        assert_eq!(ir.sent().len(), 1);
    }

    #[test]
    fn partial_line_dies_with_its_session() {
        let (mut bridge, listener, ir) = bridge(None);
        let client = connected_client(&mut bridge, &listener, 4011);

        client.push_input(b"on");
        client.close();
        let events = bridge.poll_once().unwrap();

        assert_eq!(
            events,
            vec![BridgeEvent::SessionClosed {
                peer: client.peer_addr()
            }]
        );
        assert!(ir.sent().is_empty());
    }

    #[test]
    fn oversized_line_is_rejected_without_dispatch() {
        let (mut bridge, listener, ir) = bridge(None);
        let client = connected_client(&mut bridge, &listener, 4012);

        let mut input = vec![b'x'; MAX_LINE_BYTES + 1];
        input.push(b'\n');
        client.push_input(&input);
        let events = bridge.poll_once().unwrap();

        assert_eq!(
            events,
            vec![BridgeEvent::OversizedLineDropped {
                length: MAX_LINE_BYTES + 1
            }]
        );
        assert!(ir.sent().is_empty());
        assert_eq!(client.written(), "Invalid command");
    }

    #[test]
    fn receiver_captures_are_surfaced() {
        let signal = DecodedSignal::from_timings(vec![9000, 4500, 560]);
        let receiver = ScriptedReceiver {
            pending: VecDeque::from([signal.clone()]),
        };
        let (mut bridge, _listener, _ir) = bridge(Some(receiver));

        let events = bridge.poll_once().unwrap();

        assert_eq!(events, vec![BridgeEvent::SignalReceived(signal)]);
    }

    #[test]
    fn disabled_receiver_stays_quiet() {
        let listener = FakeListener::default();
        let mut bridge: Bridge<FakeListener, RecordingIr, DisabledReceiver> = Bridge::new(
            listener,
            CommandInterpreter::new(SignalLibrary::builtin()),
            RecordingIr::default(),
            None,
        );

        assert!(bridge.poll_once().unwrap().is_empty());
    }
}
