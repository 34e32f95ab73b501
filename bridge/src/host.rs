use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{info, warn};

use irbridge_common::{
    Bridge, BridgeEvent, CommandInterpreter, DisabledReceiver, IrTransmit, RawPulseSequence,
    RuntimeConfig, SignalLibrary, TransportError,
};

use crate::net::TcpCommandListener;

const POLL_YIELD_MS: u64 = 5;

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let mut runtime = store.load().unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let library = SignalLibrary::from_entries(&runtime.signals)
        .context("signal table in runtime config is invalid")?;
    info!(
        "signal library loaded: {} command(s): {:?}",
        library.len(),
        library.names().collect::<Vec<_>>()
    );

    let port = std::env::var("BRIDGE_LISTEN_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.listen_port);
    let listener = TcpCommandListener::bind((Ipv4Addr::UNSPECIFIED, port))
        .with_context(|| format!("failed to bind command listener on port {port}"))?;
    info!("command listener on {}", listener.local_addr()?);

    let transmitter = SimulatedIr::new(runtime.ir.min_send_interval_ms);
    let mut bridge = Bridge::new(
        listener,
        CommandInterpreter::new(library),
        transmitter,
        None::<DisabledReceiver>,
    );

    loop {
        for event in bridge.poll_once()? {
            log_event(&event);
        }
        thread::sleep(Duration::from_millis(POLL_YIELD_MS));
    }
}

/// Development stand-in for the RMT emitter: honors the send interval and
/// logs each frame instead of driving a pin.
struct SimulatedIr {
    min_send_interval_ms: u64,
    last_send_ms: Option<u64>,
    sent_frames: u64,
}

impl SimulatedIr {
    fn new(min_send_interval_ms: u64) -> Self {
        Self {
            min_send_interval_ms,
            last_send_ms: None,
            sent_frames: 0,
        }
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

impl IrTransmit for SimulatedIr {
    fn transmit(&mut self, sequence: &RawPulseSequence) -> Result<(), TransportError> {
        self.rate_limit();
        // The real emitter blocks for the waveform; keep the timing honest.
        thread::sleep(Duration::from_micros(sequence.duration_us()));
        self.sent_frames += 1;
        self.last_send_ms = Some(monotonic_ms());
        info!(
            "ir frame #{}: {} pulses at {}kHz (~{}ms)",
            self.sent_frames,
            sequence.len(),
            sequence.carrier_khz(),
            sequence.duration_us() / 1000
        );
        Ok(())
    }
}

struct ConfigStore {
    runtime_path: PathBuf,
}

impl ConfigStore {
    fn new() -> Self {
        let data_dir = std::env::var("BRIDGE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.irbridge"));

        Self {
            runtime_path: data_dir.join("runtime.json"),
        }
    }

    fn load(&self) -> anyhow::Result<RuntimeConfig> {
        match std::fs::read(&self.runtime_path) {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

fn log_event(event: &BridgeEvent) {
    match event {
        BridgeEvent::SessionOpened { peer } => {
            info!("connection accepted from {}", fmt_peer(peer));
        }
        BridgeEvent::SessionRejected { peer } => {
            info!(
                "connection rejected from {}; a client is already attached",
                fmt_peer(peer)
            );
        }
        BridgeEvent::SessionClosed { peer } => info!("client {} disconnected", fmt_peer(peer)),
        BridgeEvent::AcceptFailed { error } => warn!("accept failed: {error}"),
        BridgeEvent::CommandAccepted { name } => info!("command `{name}` accepted"),
        BridgeEvent::CommandRejected { input } => info!("invalid command `{input}`"),
        BridgeEvent::OversizedLineDropped { length } => {
            warn!("dropped oversized command line ({length} bytes)");
        }
        BridgeEvent::SignalReceived(signal) => info!("ir capture: {signal}"),
        BridgeEvent::ReceiveFailed { error } => warn!("ir receive error: {error}"),
    }
}

fn fmt_peer(peer: &Option<std::net::SocketAddr>) -> String {
    peer.map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown peer".to_string())
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
