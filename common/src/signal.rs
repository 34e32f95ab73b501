use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codes;

pub const MIN_CARRIER_KHZ: u32 = 10;
pub const MAX_CARRIER_KHZ: u32 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("empty pulse sequence")]
    EmptySequence,
    #[error("carrier {0}kHz is outside the supported 10-100kHz range")]
    CarrierOutOfRange(u32),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LibraryError {
    #[error("signal entry with empty name")]
    UnnamedEntry,
    #[error("signal `{0}` registered twice")]
    Duplicate(String),
    #[error("signal `{name}`: {error}")]
    Invalid {
        name: String,
        #[source]
        error: SignalError,
    },
}

/// An immutable mark/space timing sequence and its modulation carrier.
///
/// Durations are microseconds, alternating mark/space starting with a mark.
/// The `u16` element type bounds each segment to what the emitter hardware
/// can represent, so an out-of-range duration is a deserialization error
/// rather than anything this type has to police at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPulseSequence {
    timings: Vec<u16>,
    carrier_khz: u32,
}

impl RawPulseSequence {
    pub fn new(timings: Vec<u16>, carrier_khz: u32) -> Result<Self, SignalError> {
        if timings.is_empty() {
            return Err(SignalError::EmptySequence);
        }
        if !(MIN_CARRIER_KHZ..=MAX_CARRIER_KHZ).contains(&carrier_khz) {
            return Err(SignalError::CarrierOutOfRange(carrier_khz));
        }
        Ok(Self {
            timings,
            carrier_khz,
        })
    }

    pub fn timings(&self) -> &[u16] {
        &self.timings
    }

    pub fn carrier_khz(&self) -> u32 {
        self.carrier_khz
    }

    pub fn len(&self) -> usize {
        self.timings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timings.is_empty()
    }

    /// Total waveform duration in microseconds.
    pub fn duration_us(&self) -> u64 {
        self.timings.iter().map(|&t| u64::from(t)).sum()
    }
}

/// Configuration form of one library entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalEntry {
    pub name: String,
    pub carrier_khz: u32,
    pub timings: Vec<u16>,
}

/// Immutable command-name → pulse-sequence mapping, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct SignalLibrary {
    signals: BTreeMap<String, RawPulseSequence>,
}

impl SignalLibrary {
    pub fn from_entries(entries: &[SignalEntry]) -> Result<Self, LibraryError> {
        let mut signals = BTreeMap::new();
        for entry in entries {
            let name = entry.name.trim();
            if name.is_empty() {
                return Err(LibraryError::UnnamedEntry);
            }
            let sequence = RawPulseSequence::new(entry.timings.clone(), entry.carrier_khz)
                .map_err(|error| LibraryError::Invalid {
                    name: name.to_string(),
                    error,
                })?;
            if signals.insert(name.to_string(), sequence).is_some() {
                return Err(LibraryError::Duplicate(name.to_string()));
            }
        }
        Ok(Self { signals })
    }

    /// The factory library: the single power capture from the bridged
    /// appliance.
    pub fn builtin() -> Self {
        Self::from_entries(&builtin_entries()).expect("factory signal table is valid")
    }

    pub fn lookup(&self, name: &str) -> Option<&RawPulseSequence> {
        self.signals.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.signals.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

pub fn builtin_entries() -> Vec<SignalEntry> {
    vec![SignalEntry {
        name: codes::POWER_COMMAND.to_string(),
        carrier_khz: codes::POWER_CARRIER_KHZ,
        timings: codes::POWER_RAW.to_vec(),
    }]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn registered_sequence_round_trips() {
        let entries = vec![SignalEntry {
            name: "mute".to_string(),
            carrier_khz: 36,
            timings: vec![900, 450, 900],
        }];
        let library = SignalLibrary::from_entries(&entries).unwrap();

        let sequence = library.lookup("mute").unwrap();
        assert_eq!(sequence.len(), 3);
        assert_eq!(sequence.carrier_khz(), 36);
        assert_eq!(sequence.timings(), &[900, 450, 900]);
    }

    #[test]
    fn builtin_library_carries_the_power_capture() {
        let library = SignalLibrary::builtin();

        let sequence = library.lookup("on").unwrap();
        assert_eq!(sequence.len(), 71);
        assert_eq!(sequence.carrier_khz(), 38);
        assert_eq!(sequence.timings()[0], 9054);
        assert!(library.lookup("off").is_none());
    }

    #[test]
    fn duplicate_names_rejected() {
        let entry = SignalEntry {
            name: "on".to_string(),
            carrier_khz: 38,
            timings: vec![100],
        };
        let result = SignalLibrary::from_entries(&[entry.clone(), entry]);

        assert_eq!(result.unwrap_err(), LibraryError::Duplicate("on".to_string()));
    }

    #[test]
    fn empty_sequence_rejected() {
        let result = RawPulseSequence::new(Vec::new(), 38);
        assert_eq!(result.unwrap_err(), SignalError::EmptySequence);
    }

    #[test]
    fn carrier_outside_band_rejected() {
        assert_eq!(
            RawPulseSequence::new(vec![100], 5).unwrap_err(),
            SignalError::CarrierOutOfRange(5)
        );
        assert_eq!(
            RawPulseSequence::new(vec![100], 120).unwrap_err(),
            SignalError::CarrierOutOfRange(120)
        );
        assert!(RawPulseSequence::new(vec![100], 38).is_ok());
    }

    #[test]
    fn library_names_entry_in_errors() {
        let entries = vec![SignalEntry {
            name: "broken".to_string(),
            carrier_khz: 38,
            timings: Vec::new(),
        }];
        let error = SignalLibrary::from_entries(&entries).unwrap_err();

        assert_eq!(
            error,
            LibraryError::Invalid {
                name: "broken".to_string(),
                error: SignalError::EmptySequence,
            }
        );
    }

    #[test]
    fn duration_sums_every_segment() {
        let sequence = RawPulseSequence::new(vec![1000, 500, 1000], 38).unwrap();
        assert_eq!(sequence.duration_us(), 2500);
    }
}
