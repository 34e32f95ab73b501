use std::{net::Ipv4Addr, sync::mpsc, thread, time::Duration};

use anyhow::{anyhow, Context};
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        gpio::{AnyInputPin, AnyOutputPin},
        modem::Modem,
        prelude::Peripherals,
        rmt::RMT,
    },
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use irbridge_common::{
    config::NetworkConfig, Bridge, BridgeEvent, CommandInterpreter, ConnectivityEvent,
    RuntimeConfig, SignalLibrary,
};

use crate::ir::{self, IrCapture, IrTransmitter};
use crate::net::TcpCommandListener;

const NVS_NAMESPACE: &str = "irbridge";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
/// Settling delay before the recovery restart after network loss.
const RESTART_SETTLE_MS: u64 = 2_000;
const CONNECTIVITY_POLL_MS: u64 = 500;
const POLL_YIELD_MS: u64 = 10;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    let library = SignalLibrary::from_entries(&runtime.signals)
        .context("signal table in runtime config is invalid")?;
    info!(
        "signal library loaded: {} command(s): {:?}",
        library.len(),
        library.names().collect::<Vec<_>>()
    );

    ir::low_level_sanity_check().context("RMT sanity check failed")?;

    let Peripherals { modem, rmt, .. } = Peripherals::take()?;
    let RMT {
        channel0,
        channel1,
        channel2,
        channel3,
        ..
    } = rmt;

    let tx_pin = runtime.ir.tx_pin;
    let transmitter = match runtime.ir.rmt_channel {
        0 => unsafe { IrTransmitter::new(channel0, AnyOutputPin::new(tx_pin), &runtime.ir) },
        1 => unsafe { IrTransmitter::new(channel1, AnyOutputPin::new(tx_pin), &runtime.ir) },
        2 => unsafe { IrTransmitter::new(channel2, AnyOutputPin::new(tx_pin), &runtime.ir) },
        channel => Err(anyhow!("unsupported TX RMT channel: {channel}")),
    }
    .context("failed to initialize IR transmitter")?;
    info!(
        "IR transmitter initialized on RMT channel{} / GPIO{} @ {}kHz",
        runtime.ir.rmt_channel, tx_pin, runtime.ir.carrier_khz
    );

    let receiver = if runtime.ir.receive_enabled {
        let capture = unsafe { IrCapture::new(channel3, AnyInputPin::new(runtime.ir.rx_pin)) }
            .context("failed to initialize IR capture")?;
        info!("IR capture enabled on GPIO{}", runtime.ir.rx_pin);
        Some(capture)
    } else {
        None
    };

    let (wifi, station_ip) =
        match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network) {
            Ok(up) => up,
            Err(err) => {
                warn!("wifi startup failed: {err:#}; restarting after settle delay");
                settle_and_restart();
            }
        };
    info!("wifi connected, station ip {station_ip}");
    disable_wifi_power_save();

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register main loop with watchdog: {err:#}");
    }

    let (connectivity_tx, connectivity_rx) = mpsc::channel();
    spawn_connectivity_monitor(connectivity_tx, station_ip);

    let listener = TcpCommandListener::bind((Ipv4Addr::UNSPECIFIED, runtime.network.listen_port))
        .with_context(|| {
            format!(
                "failed to bind command listener on port {}",
                runtime.network.listen_port
            )
        })?;
    info!("command listener on port {}", runtime.network.listen_port);

    let mut bridge = Bridge::new(
        listener,
        CommandInterpreter::new(library),
        transmitter,
        receiver,
    );

    // Keep wifi alive for the program lifetime.
    let _wifi = wifi;

    loop {
        feed_watchdog();

        while let Ok(event) = connectivity_rx.try_recv() {
            match event {
                ConnectivityEvent::Connected(ip) => info!("network up, station ip {ip}"),
                ConnectivityEvent::Disconnected => {
                    warn!("network connection lost; restarting");
                    settle_and_restart();
                }
            }
        }

        for event in bridge.poll_once()? {
            log_event(&event);
        }

        // Yield so lwip housekeeping and the idle task run even after a long
        // blocking transmission.
        thread::sleep(Duration::from_millis(POLL_YIELD_MS));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let len = match nvs.blob_len(NVS_RUNTIME_KEY)? {
            Some(len) => len,
            None => return Ok(RuntimeConfig::default()),
        };
        let mut buf = vec![0u8; len];
        let raw = nvs
            .get_blob(NVS_RUNTIME_KEY, &mut buf)?
            .ok_or_else(|| anyhow!("runtime config blob vanished during read"))?;
        Ok(serde_json::from_slice::<RuntimeConfig>(raw)?)
    }
}

fn has_station_credentials(network: &NetworkConfig) -> bool {
    let ssid = network.wifi_ssid.trim();
    !ssid.is_empty() && ssid != "CHANGE_ME"
}

fn ipv4_from_octets(ip: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])
}

fn build_sta_netif(network: &NetworkConfig) -> anyhow::Result<Option<EspNetif>> {
    if !network.use_static_ip {
        return Ok(None);
    }

    let static_ip = network
        .static_ip
        .ok_or_else(|| anyhow!("static_ip is required when use_static_ip is true"))?;
    let gateway = network
        .gateway
        .ok_or_else(|| anyhow!("gateway is required when use_static_ip is true"))?;
    let subnet = network
        .subnet
        .ok_or_else(|| anyhow!("subnet is required when use_static_ip is true"))?;

    let mask_ip = ipv4_from_octets(subnet);
    let mask = Mask::try_from(mask_ip).map_err(|_| anyhow!("invalid subnet mask: {}", mask_ip))?;

    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip: ipv4_from_octets(static_ip),
                subnet: Subnet {
                    gateway: ipv4_from_octets(gateway),
                    mask,
                },
                dns: network.dns.map(ipv4_from_octets),
                secondary_dns: None,
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };

    Ok(Some(EspNetif::new_with_conf(&conf)?))
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<(EspWifi<'static>, Ipv4Addr)> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    if let Some(sta_netif) = build_sta_netif(network)? {
        esp_wifi
            .swap_netif_sta(sta_netif)
            .context("failed to apply static IP netif configuration")?;
    }

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if !has_station_credentials(network) {
        return Err(anyhow!(
            "wifi credentials missing; set wifi_ssid/wifi_pass in NVS or WIFI_SSID/WIFI_PASS at build time"
        ));
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect() {
            Ok(()) => match wifi.wait_netif_up() {
                Ok(()) => {
                    info!("wifi connected and netif up on attempt {attempt}");
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!("wifi netif up failed on attempt {attempt}: {err:#}");
                    last_err = Some(err);
                }
            },
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err}"
        ));
    }

    let station_ip = wifi
        .wifi()
        .sta_netif()
        .get_ip_info()
        .map(|info| info.ip)
        .unwrap_or(Ipv4Addr::UNSPECIFIED);

    Ok((esp_wifi, station_ip))
}

fn spawn_connectivity_monitor(tx: mpsc::Sender<ConnectivityEvent>, station_ip: Ipv4Addr) {
    thread::Builder::new()
        .name("connectivity".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            let mut connected = true;
            loop {
                let now_connected = is_wifi_station_connected();
                if now_connected != connected {
                    connected = now_connected;
                    let event = if connected {
                        ConnectivityEvent::Connected(station_ip)
                    } else {
                        ConnectivityEvent::Disconnected
                    };
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                thread::sleep(Duration::from_millis(CONNECTIVITY_POLL_MS));
            }
        })
        .expect("failed to spawn connectivity monitor thread");
}

fn settle_and_restart() -> ! {
    thread::sleep(Duration::from_millis(RESTART_SETTLE_MS));
    unsafe { esp_idf_svc::sys::esp_restart() };
    unreachable!("esp_restart does not return");
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
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
