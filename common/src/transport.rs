use std::fmt;

use thiserror::Error;

use crate::signal::RawPulseSequence;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("ir transmit failed: {0}")]
    Transmit(String),
    #[error("ir receive failed: {0}")]
    Receive(String),
}

/// Drives the emitter through a raw mark/space pattern.
///
/// Blocks for the duration of the waveform, tens of milliseconds for typical
/// remote-control signals. A failure here is fatal to the bridge; the device
/// has exactly one job.
pub trait IrTransmit {
    fn transmit(&mut self, sequence: &RawPulseSequence) -> Result<(), TransportError>;
}

/// Non-blocking poll for a completed capture on the receive pin.
pub trait IrReceive {
    fn poll_received(&mut self) -> Result<Option<DecodedSignal>, TransportError>;
}

/// Receiver used when capture hardware is absent or disabled.
pub struct DisabledReceiver;

impl IrReceive for DisabledReceiver {
    fn poll_received(&mut self) -> Result<Option<DecodedSignal>, TransportError> {
        Ok(None)
    }
}

/// A captured waveform plus a rendered one-line description.
///
/// The bridge forwards this to the logging collaborator unmodified; nothing
/// in the command path interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSignal {
    pub summary: String,
    pub timings: Vec<u16>,
}

impl DecodedSignal {
    pub fn from_timings(timings: Vec<u16>) -> Self {
        let summary = summarize(&timings);
        Self { summary, timings }
    }
}

impl fmt::Display for DecodedSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary)
    }
}

fn summarize(timings: &[u16]) -> String {
    let total_us: u64 = timings.iter().map(|&t| u64::from(t)).sum();
    format!(
        "{} edges over ~{}ms, signature {:08X}",
        timings.len(),
        total_us / 1000,
        signature(timings)
    )
}

/// Order-sensitive signature of a pulse train.
///
/// Durations two positions apart are bucketed as shorter/similar/longer with
/// 20% tolerance before hashing, so repeated captures of the same button
/// match despite timing jitter. Useful for telling signals apart in logs
/// without decoding any protocol.
pub fn signature(timings: &[u16]) -> u32 {
    const FNV_PRIME: u32 = 16_777_619;
    const FNV_BASIS: u32 = 2_166_136_261;

    let mut hash = FNV_BASIS;
    for window in timings.windows(3) {
        let value = compare(window[0], window[2]);
        hash = (hash ^ value).wrapping_mul(FNV_PRIME);
    }
    hash
}

fn compare(old: u16, new: u16) -> u32 {
    let old = u32::from(old);
    let new = u32::from(new);
    if new * 10 < old * 8 {
        0
    } else if old * 10 < new * 8 {
        2
    } else {
        1
    }
}
