use serde::{Deserialize, Serialize};

use crate::signal::{builtin_entries, SignalEntry, MAX_CARRIER_KHZ, MIN_CARRIER_KHZ};

pub const DEFAULT_LISTEN_PORT: u16 = 5457;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub listen_port: u16,
    pub use_static_ip: bool,
    pub static_ip: Option<[u8; 4]>,
    pub gateway: Option<[u8; 4]>,
    pub subnet: Option<[u8; 4]>,
    pub dns: Option<[u8; 4]>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            listen_port: DEFAULT_LISTEN_PORT,
            use_static_ip: false,
            static_ip: None,
            gateway: None,
            subnet: None,
            dns: None,
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        if self.listen_port == 0 {
            self.listen_port = DEFAULT_LISTEN_PORT;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IrHardwareConfig {
    pub tx_pin: i32,
    pub rx_pin: i32,
    /// TX RMT channel, 0-2. Channel 3 is reserved for capture.
    pub rmt_channel: u8,
    pub carrier_khz: u32,
    /// Floor between consecutive frames; the observed device settles for 2s
    /// after every send.
    pub min_send_interval_ms: u64,
    pub repeat_count: usize,
    pub repeat_gap_ms: u64,
    pub receive_enabled: bool,
}

impl Default for IrHardwareConfig {
    fn default() -> Self {
        Self {
            tx_pin: 9,
            rx_pin: 26,
            rmt_channel: 0,
            carrier_khz: 38,
            min_send_interval_ms: 2_000,
            repeat_count: 1,
            repeat_gap_ms: 50,
            receive_enabled: false,
        }
    }
}

impl IrHardwareConfig {
    pub fn sanitize(&mut self) {
        if self.tx_pin < 0 {
            self.tx_pin = 9;
        }
        if self.rx_pin < 0 {
            self.rx_pin = 26;
        }
        if self.rmt_channel > 2 {
            self.rmt_channel = 0;
        }
        self.carrier_khz = self.carrier_khz.clamp(MIN_CARRIER_KHZ, MAX_CARRIER_KHZ);
        self.repeat_count = self.repeat_count.clamp(1, 10);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub network: NetworkConfig,
    #[serde(default)]
    pub ir: IrHardwareConfig,
    /// Command name → pulse sequence table. Grows without touching protocol
    /// code; invalid entries abort startup.
    #[serde(default = "builtin_entries")]
    pub signals: Vec<SignalEntry>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            ir: IrHardwareConfig::default(),
            signals: builtin_entries(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.network.sanitize();
        self.ir.sanitize();
    }
}
