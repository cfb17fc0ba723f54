//! Receiver discovery.
//!
//! - bridges `DiscoveryListener` callbacks onto the event bus
//! - browses receivers via mDNS (`mdns-sd`, no system daemon dependency) and asks a
//!   `PlayerConnector` for the control proxy of each resolved endpoint

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::broadcast::Sender;

use crate::device_registry::Device;
use crate::error::FlingError;
use crate::protocol::{DiscoveryMessage, Message};
use crate::remote::{DiscoveryListener, DiscoveryService, RemotePlayer};

const DISCOVERY_POLL: Duration = Duration::from_millis(250);

/// Forwards discovery callbacks, from any thread, to the session manager.
pub struct BusDiscoveryListener {
    bus_producer: Sender<Message>,
}

impl BusDiscoveryListener {
    pub fn new(bus_producer: Sender<Message>) -> Self {
        Self { bus_producer }
    }

    fn post(&self, message: DiscoveryMessage) {
        if self.bus_producer.send(Message::Discovery(message)).is_err() {
            debug!("BusDiscoveryListener: no bus receivers");
        }
    }
}

impl DiscoveryListener for BusDiscoveryListener {
    fn device_found(&self, device: Device) {
        self.post(DiscoveryMessage::DeviceFound(device));
    }

    fn device_lost(&self, device: Device) {
        self.post(DiscoveryMessage::DeviceLost(device));
    }

    fn discovery_failure(&self, reason: String) {
        self.post(DiscoveryMessage::DiscoveryFailure(reason));
    }
}

/// Network location and identity of a resolved receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverEndpoint {
    pub id: String,
    pub name: String,
    pub fullname: String,
    pub host: String,
    pub address: String,
    pub port: u16,
}

/// Builds the control proxy for a resolved endpoint.
pub trait PlayerConnector: Send + Sync {
    /// `None` skips the endpoint.
    fn connect(&self, endpoint: &ReceiverEndpoint) -> Option<Arc<dyn RemotePlayer>>;
}

/// Maps a service id to a DNS-SD service type; full types pass through unchanged.
pub fn dns_sd_service_type(service_type: &str) -> String {
    let trimmed = service_type.trim();
    if trimmed.ends_with(".local.") {
        return trimmed.to_string();
    }
    format!(
        "_{}._tcp.local.",
        trimmed.trim_start_matches('_').replace('.', "-")
    )
}

fn instance_name_from_fullname(fullname: &str, service_type: &str) -> String {
    let suffix = format!(".{}", service_type);
    fullname
        .trim()
        .strip_suffix(suffix.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(fullname)
        .trim_matches('.')
        .to_string()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

/// Derives id and name: TXT `id` else `host:address:port`, TXT `fn` else the
/// instance name. Endpoints without an IPv4 address are skipped.
pub fn endpoint_from_parts(
    service_type: &str,
    fullname: &str,
    hostname: &str,
    mut addresses: Vec<Ipv4Addr>,
    port: u16,
    friendly_name: Option<&str>,
    id_property: Option<&str>,
) -> Option<ReceiverEndpoint> {
    addresses.sort();
    let address = addresses.first().map(ToString::to_string)?;
    let host = hostname.trim_end_matches('.').to_string();
    let name = non_empty(friendly_name)
        .unwrap_or_else(|| instance_name_from_fullname(fullname, service_type));
    let id = non_empty(id_property).unwrap_or_else(|| format!("{}:{}:{}", host, address, port));
    Some(ReceiverEndpoint {
        id,
        name,
        fullname: fullname.to_string(),
        host,
        address,
        port,
    })
}

fn endpoint_from_resolved_service(
    service_type: &str,
    service: &mdns_sd::ResolvedService,
) -> Option<ReceiverEndpoint> {
    let addresses: Vec<Ipv4Addr> = service.get_addresses_v4().iter().copied().collect();
    endpoint_from_parts(
        service_type,
        service.get_fullname(),
        service.get_hostname(),
        addresses,
        service.get_port(),
        service.get_property_val_str("fn"),
        service.get_property_val_str("id"),
    )
}

struct BrowseWorker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// `DiscoveryService` backed by an in-process mDNS daemon.
pub struct MdnsDiscovery {
    connector: Arc<dyn PlayerConnector>,
    worker: Option<BrowseWorker>,
}

impl MdnsDiscovery {
    pub fn new(connector: Arc<dyn PlayerConnector>) -> Self {
        Self {
            connector,
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

fn run_browse_loop(
    mdns: ServiceDaemon,
    service_type: String,
    browse_receiver: mdns_sd::Receiver<ServiceEvent>,
    connector: Arc<dyn PlayerConnector>,
    listener: Arc<dyn DiscoveryListener>,
    running: Arc<AtomicBool>,
) {
    let mut found_by_fullname: HashMap<String, Device> = HashMap::new();
    while running.load(Ordering::Acquire) {
        let event = match browse_receiver.recv_timeout(DISCOVERY_POLL) {
            Ok(event) => event,
            Err(_) if browse_receiver.is_disconnected() => {
                if running.load(Ordering::Acquire) {
                    listener.discovery_failure("mDNS browse channel closed".to_string());
                }
                break;
            }
            Err(_) => continue,
        };
        match event {
            ServiceEvent::ServiceResolved(service) => {
                let Some(endpoint) = endpoint_from_resolved_service(&service_type, &service)
                else {
                    continue;
                };
                let Some(player) = connector.connect(&endpoint) else {
                    debug!(
                        "MdnsDiscovery: no player for {} ({})",
                        endpoint.name, endpoint.address
                    );
                    continue;
                };
                let device = Device::new(endpoint.id.clone(), endpoint.name.clone(), player);
                found_by_fullname.insert(endpoint.fullname.clone(), device.clone());
                listener.device_found(device);
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                if let Some(device) = found_by_fullname.remove(&fullname) {
                    listener.device_lost(device);
                }
            }
            ServiceEvent::SearchStopped(_) => break,
            _ => {}
        }
    }

    if let Err(err) = mdns.stop_browse(&service_type) {
        debug!("MdnsDiscovery: failed to stop mDNS browse cleanly: {}", err);
    }
    let _ = mdns.shutdown();
    info!("MdnsDiscovery: browse loop finished");
}

impl DiscoveryService for MdnsDiscovery {
    fn start(
        &mut self,
        service_type: &str,
        listener: Arc<dyn DiscoveryListener>,
    ) -> Result<(), FlingError> {
        if self.worker.is_some() {
            debug!("MdnsDiscovery: already running");
            return Ok(());
        }
        let service_type = dns_sd_service_type(service_type);
        let mdns = ServiceDaemon::new().map_err(|err| {
            FlingError::DiscoveryFailure(format!("failed to start mDNS daemon: {err}"))
        })?;
        let browse_receiver = match mdns.browse(&service_type) {
            Ok(receiver) => receiver,
            Err(err) => {
                let _ = mdns.shutdown();
                return Err(FlingError::DiscoveryFailure(format!(
                    "failed to browse {service_type}: {err}"
                )));
            }
        };

        let running = Arc::new(AtomicBool::new(true));
        let worker_running = Arc::clone(&running);
        let connector = Arc::clone(&self.connector);
        info!("MdnsDiscovery: browsing {}", service_type);
        let handle = thread::Builder::new()
            .name("mdns-discovery".to_string())
            .spawn(move || {
                run_browse_loop(
                    mdns,
                    service_type,
                    browse_receiver,
                    connector,
                    listener,
                    worker_running,
                )
            })
            .map_err(|err| {
                FlingError::DiscoveryFailure(format!("failed to spawn browse thread: {err}"))
            })?;
        self.worker = Some(BrowseWorker { running, handle });
        Ok(())
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.running.store(false, Ordering::Release);
        if worker.handle.join().is_err() {
            warn!("MdnsDiscovery: browse thread panicked");
        }
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}
