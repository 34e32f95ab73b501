use core::convert::TryInto;
use std::{
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use esp_idf_hal::{
    gpio::{InputPin, OutputPin},
    peripheral::Peripheral,
    rmt::{
        config::{CarrierConfig, DutyPercent, ReceiveConfig, TransmitConfig},
        PinState, Pulse, PulseTicks, Receive, RmtChannel, RxRmtDriver, TxRmtDriver,
        VariableLengthSignal,
    },
    units::FromValueType,
};
use log::{info, warn};

use irbridge_common::{
    config::IrHardwareConfig,
    signal::RawPulseSequence,
    transport::{DecodedSignal, IrReceive, IrTransmit, TransportError},
};

/// 80MHz APB clock divided down to 1µs per RMT tick.
const IR_TICK_DIVIDER: u8 = 80;
/// RMT stores a duration in a 15 bit field; longer marks and spaces are
/// split across consecutive entries at the same level.
const MAX_PULSE_TICKS: u16 = 0x7FFF;
/// A gap this long ends a capture. Keeps multi-burst remotes from smearing
/// into one endless event.
const RX_IDLE_THRESHOLD_TICKS: u16 = 15_000;
const RX_RING_BUFFER_SIZE: usize = 1024;
const RX_CAPTURE_PAIRS: usize = 512;

/// Confirms the HAL packs pulse durations the way the replay math assumes:
/// a 15 bit tick field behind a `u16` surface. Runs once before the main
/// loop; a failure here means replayed timings would be corrupted, so the
/// device must not start serving commands.
pub fn low_level_sanity_check() -> anyhow::Result<()> {
    if PulseTicks::new(MAX_PULSE_TICKS).is_err() {
        bail!("RMT tick field narrower than expected");
    }
    if PulseTicks::new(MAX_PULSE_TICKS + 1).is_ok() {
        bail!("RMT tick field wider than expected; duration splitting would corrupt timings");
    }
    Ok(())
}

pub struct IrTransmitter {
    tx: TxRmtDriver<'static>,
    carrier_khz: u32,
    min_send_interval_ms: u64,
    repeat_count: usize,
    repeat_gap_ms: u64,
    last_send_ms: Option<u64>,
    sent_frames: u64,
}

impl IrTransmitter {
    pub fn new<C, P>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = P> + 'static,
        ir: &IrHardwareConfig,
    ) -> anyhow::Result<Self>
    where
        C: RmtChannel,
        P: OutputPin,
    {
        let carrier = CarrierConfig::new()
            .frequency(ir.carrier_khz.kHz().into())
            .carrier_level(PinState::High)
            .duty_percent(DutyPercent::new(33)?);

        let config = TransmitConfig::new()
            .clock_divider(IR_TICK_DIVIDER)
            .carrier(Some(carrier))
            .idle(Some(PinState::Low));

        let tx = TxRmtDriver::new(channel, pin, &config).context("failed to init RMT IR driver")?;

        Ok(Self {
            tx,
            carrier_khz: ir.carrier_khz,
            min_send_interval_ms: ir.min_send_interval_ms,
            repeat_count: ir.repeat_count,
            repeat_gap_ms: ir.repeat_gap_ms,
            last_send_ms: None,
            sent_frames: 0,
        })
    }

    fn rate_limit(&mut self) {
        let now = monotonic_ms();
        if let Some(last) = self.last_send_ms {
            let elapsed = now.saturating_sub(last);
            if elapsed < self.min_send_interval_ms {
                thread::sleep(Duration::from_millis(self.min_send_interval_ms - elapsed));
            }
        }
    }
}

impl IrTransmit for IrTransmitter {
    fn transmit(&mut self, sequence: &RawPulseSequence) -> Result<(), TransportError> {
        if sequence.carrier_khz() != self.carrier_khz {
            // Carrier is fixed at driver setup; the timing pattern still
            // replays, most receivers tolerate the offset.
            warn!(
                "sequence expects {}kHz carrier, emitter configured for {}kHz",
                sequence.carrier_khz(),
                self.carrier_khz
            );
        }

        self.rate_limit();

        let signal = build_signal(sequence.timings())
            .map_err(|err| TransportError::Transmit(format!("{err:#}")))?;

        for repeat in 0..self.repeat_count {
            self.tx
                .start_blocking(&signal)
                .map_err(|err| TransportError::Transmit(format!("RMT transmit failed: {err}")))?;
            if repeat + 1 < self.repeat_count {
                thread::sleep(Duration::from_millis(self.repeat_gap_ms));
            }
        }

        self.last_send_ms = Some(monotonic_ms());
        self.sent_frames = self.sent_frames.saturating_add(1);
        info!(
            "ir frame #{} sent: {} pulses (~{}ms)",
            self.sent_frames,
            sequence.len(),
            sequence.duration_us() / 1000
        );
        Ok(())
    }
}

fn build_signal(timings: &[u16]) -> anyhow::Result<VariableLengthSignal> {
    let mut pulses = Vec::with_capacity(timings.len());
    for (index, &duration) in timings.iter().enumerate() {
        let level = if index % 2 == 0 {
            PinState::High
        } else {
            PinState::Low
        };
        push_split(&mut pulses, level, duration)?;
    }

    let pulse_refs: Vec<&Pulse> = pulses.iter().collect();
    let mut signal = VariableLengthSignal::with_capacity(pulses.len());
    signal
        .push(pulse_refs)
        .context("failed to convert IR timings to RMT signal")?;
    Ok(signal)
}

fn push_split(pulses: &mut Vec<Pulse>, level: PinState, duration: u16) -> anyhow::Result<()> {
    let mut remaining = duration;
    loop {
        let chunk = remaining.min(MAX_PULSE_TICKS);
        pulses.push(Pulse::new(
            level,
            PulseTicks::new(chunk).context("invalid IR pulse duration")?,
        ));
        remaining -= chunk;
        if remaining == 0 {
            return Ok(());
        }
    }
}

/// RMT capture on the receive pin. Polled by the bridge loop; a completed
/// pulse train becomes an opaque `DecodedSignal` for the log.
pub struct IrCapture {
    rx: RxRmtDriver<'static>,
    pairs: Vec<(Pulse, Pulse)>,
}

impl IrCapture {
    pub fn new<C, P>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = P> + 'static,
    ) -> anyhow::Result<Self>
    where
        C: RmtChannel,
        P: InputPin,
    {
        let config = ReceiveConfig::new()
            .clock_divider(IR_TICK_DIVIDER)
            .idle_threshold(RX_IDLE_THRESHOLD_TICKS);

        let mut rx = RxRmtDriver::new(channel, pin, &config, RX_RING_BUFFER_SIZE)
            .context("failed to init RMT capture driver")?;
        rx.start().context("failed to start IR capture")?;

        Ok(Self {
            rx,
            pairs: vec![(Pulse::zero(), Pulse::zero()); RX_CAPTURE_PAIRS],
        })
    }
}

impl IrReceive for IrCapture {
    fn poll_received(&mut self) -> Result<Option<DecodedSignal>, TransportError> {
        match self.rx.receive(&mut self.pairs, 0) {
            Ok(Receive::Read(len)) => {
                let mut timings = Vec::with_capacity(len * 2);
                for (first, second) in self.pairs.iter().take(len) {
                    timings.push(first.ticks.ticks());
                    // The final entry of a train pads its second half with a
                    // zero-length pulse.
                    if second.ticks.ticks() > 0 {
                        timings.push(second.ticks.ticks());
                    }
                }
                if timings.is_empty() {
                    return Ok(None);
                }
                Ok(Some(DecodedSignal::from_timings(timings)))
            }
            Ok(Receive::Timeout) => Ok(None),
            Ok(Receive::Overflow) => Err(TransportError::Receive(
                "capture buffer overflow; signal too long".to_string(),
            )),
            Err(err) => Err(TransportError::Receive(format!("RMT receive failed: {err}"))),
        }
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
