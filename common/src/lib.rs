pub mod bridge;
pub mod codes;
pub mod command;
pub mod config;
pub mod session;
pub mod signal;
pub mod transport;
pub mod types;

pub use bridge::{Bridge, BridgeError};
pub use command::{CommandInterpreter, CommandResult};
pub use config::{IrHardwareConfig, NetworkConfig, RuntimeConfig};
pub use session::{ClientLink, CommandListener, LinkRead, SessionManager};
pub use signal::{LibraryError, RawPulseSequence, SignalEntry, SignalError, SignalLibrary};
pub use transport::{DecodedSignal, DisabledReceiver, IrReceive, IrTransmit, TransportError};
pub use types::{BridgeEvent, ConnectivityEvent};
