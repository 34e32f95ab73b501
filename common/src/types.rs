use std::net::{Ipv4Addr, SocketAddr};

use crate::transport::DecodedSignal;

/// Discrete status emitted by one poll iteration.
///
/// The core never renders these; each platform binary decides how they reach
/// the operator (structured log, console, on-device screen).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    SessionOpened { peer: Option<SocketAddr> },
    SessionRejected { peer: Option<SocketAddr> },
    SessionClosed { peer: Option<SocketAddr> },
    AcceptFailed { error: String },
    CommandAccepted { name: String },
    CommandRejected { input: String },
    OversizedLineDropped { length: usize },
    SignalReceived(DecodedSignal),
    ReceiveFailed { error: String },
}

/// Posted by the platform connectivity provider into a channel; the
/// supervisor loop consumes these and owns the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Connected(Ipv4Addr),
    Disconnected,
}
