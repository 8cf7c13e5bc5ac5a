#![forbid(unsafe_code)]

use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use buzzer_contracts::device::DeviceRegistration;
use buzzer_contracts::pitch::{NextPitchSnapshot, Pitch};
use buzzer_engines::registry_client::{RegistryClient, RegistryClientError};
use buzzer_engines::sink::PitchSink;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const UNKNOWN_ADDRESS: &str = "unknown";

// Probe targets: one v4, one v6. Connecting a UDP socket only picks a route,
// nothing is sent.
const ADDRESS_PROBES: [&str; 2] = ["192.0.2.1:9", "[2001:db8::1]:9"];

/// Remote side of the sync loop. Blocking; called from `spawn_blocking`.
pub trait RegistryPoller: Send + Sync + 'static {
    fn fetch_next(&self) -> Result<NextPitchSnapshot, RegistryClientError>;

    fn register(&self, registration: &DeviceRegistration) -> Result<(), RegistryClientError>;
}

impl RegistryPoller for RegistryClient {
    fn fetch_next(&self) -> Result<NextPitchSnapshot, RegistryClientError> {
        RegistryClient::fetch_next(self)
    }

    fn register(&self, registration: &DeviceRegistration) -> Result<(), RegistryClientError> {
        self.register_device(registration)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub ticks: u64,
    pub updates: u64,
}

/// Polls the registry for the announced pitch and reports this device as
/// alive on every tick.
pub struct SyncClient<P: RegistryPoller> {
    poller: Arc<P>,
    interval: Duration,
    identity: DeviceRegistration,
    last_seen_id: String,
}

impl<P: RegistryPoller> SyncClient<P> {
    pub fn new(poller: Arc<P>, interval: Duration, identity: DeviceRegistration) -> Self {
        Self {
            poller,
            interval,
            identity,
            last_seen_id: String::new(),
        }
    }

    pub fn last_seen_id(&self) -> &str {
        &self.last_seen_id
    }

    /// One fetch + registration round. Returns the pitch when its id differs
    /// from the last delivered one; empty and repeated snapshots return `None`.
    /// The id only counts as seen once [`Self::mark_delivered`] is called.
    pub async fn tick(&mut self) -> Option<Pitch> {
        let poller = self.poller.clone();
        let identity = self.identity.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let next = poller.fetch_next();
            let registered = poller.register(&identity);
            (next, registered)
        })
        .await;
        let (next, registered) = match joined {
            Ok(results) => results,
            Err(err) => {
                warn!(error = %err, "sync tick aborted");
                return None;
            }
        };
        if let Err(err) = registered {
            warn!(error = %err, device = %self.identity.name, "device registration failed");
        }
        match next {
            Ok(snapshot) => {
                let id = snapshot.id_str();
                if id.is_empty() || id == self.last_seen_id {
                    debug!(id, "next pitch unchanged");
                    return None;
                }
                info!(id, "next pitch changed");
                snapshot.into_pitch()
            }
            Err(err) => {
                warn!(error = %err, "fetching next pitch failed");
                None
            }
        }
    }

    pub fn mark_delivered(&mut self, pitch: &Pitch) {
        self.last_seen_id = pitch.id.as_str().to_string();
    }

    /// Ticks once and hands a changed pitch to `sink`. A failed update leaves
    /// the id unseen, so the next tick offers it again.
    pub async fn step(&mut self, sink: &mut dyn PitchSink) -> bool {
        let Some(pitch) = self.tick().await else {
            return false;
        };
        match sink.update(&pitch) {
            Ok(()) => {
                self.mark_delivered(&pitch);
                true
            }
            Err(err) => {
                warn!(pitch = %pitch.id, error = %err, "sink update failed, retrying next tick");
                false
            }
        }
    }

    /// Ticks until `cancel` fires, then stops the sink once. A tick already
    /// running when cancellation arrives completes first.
    pub async fn run(mut self, mut sink: Box<dyn PitchSink>, cancel: CancellationToken) -> SyncSummary {
        let mut summary = SyncSummary::default();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "sync loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            summary.ticks += 1;
            if self.step(sink.as_mut()).await {
                summary.updates += 1;
            }
        }
        if let Err(err) = sink.stop() {
            warn!(error = %err, "sink stop failed");
        }
        info!(ticks = summary.ticks, updates = summary.updates, "sync loop stopped");
        summary
    }
}

/// Comma-joined non-loopback addresses this host would use for outbound
/// traffic, or `"unknown"`.
pub fn local_addresses() -> String {
    let addrs: Vec<String> = ADDRESS_PROBES
        .iter()
        .filter_map(|target| probe_route(target))
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
        .map(|ip| ip.to_string())
        .collect();
    if addrs.is_empty() {
        UNKNOWN_ADDRESS.to_string()
    } else {
        addrs.join(",")
    }
}

fn probe_route(target: &str) -> Option<IpAddr> {
    let bind = if target.starts_with('[') {
        "[::]:0"
    } else {
        "0.0.0.0:0"
    };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(target).ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

/// Name this device registers under: the configured name, else the
/// executable's file stem.
pub fn default_device_name(configured: Option<&str>) -> String {
    if let Some(name) = configured.map(str::trim).filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "buzzer".to_string())
}
