use crate::signal::SignalLibrary;
use crate::transport::{IrTransmit, TransportError};

/// Response text for anything the library does not recognize.
pub const REJECTION: &str = "Invalid command";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    Accepted(String),
    Rejected(String),
}

impl CommandResult {
    /// Response text sent back to the client. Not newline-terminated.
    pub fn render(&self) -> String {
        match self {
            Self::Accepted(name) => format!("OK: {name}"),
            Self::Rejected(reason) => reason.clone(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Matches one line of client input against the signal library and replays
/// the registered signal on a hit.
#[derive(Debug, Clone)]
pub struct CommandInterpreter {
    library: SignalLibrary,
}

impl CommandInterpreter {
    pub fn new(library: SignalLibrary) -> Self {
        Self { library }
    }

    pub fn library(&self) -> &SignalLibrary {
        &self.library
    }

    /// Runs one command line: trim, exact case-sensitive match, transmit.
    ///
    /// Transmission happens synchronously and blocks until the waveform is
    /// out. Unrecognized input, the empty line included, is rejected without
    /// touching the transmitter.
    pub fn handle<T: IrTransmit>(
        &self,
        raw_line: &str,
        ir: &mut T,
    ) -> Result<CommandResult, TransportError> {
        let name = raw_line.trim();
        match self.library.lookup(name) {
            Some(sequence) => {
                ir.transmit(sequence)?;
                Ok(CommandResult::Accepted(name.to_string()))
            }
            None => Ok(CommandResult::Rejected(REJECTION.to_string())),
        }
    }
}
