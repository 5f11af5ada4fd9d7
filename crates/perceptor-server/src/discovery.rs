//! mDNS service advertisement so capture devices can find the relay.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use mdns_sd::{ServiceDaemon, ServiceInfo};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Advertisement failures. Never fatal to the server.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The mDNS daemon rejected the request.
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),
}

/// What to advertise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    /// Instance name, e.g. `AllSpark Server`.
    pub service_name: String,
    /// Fully qualified service type, e.g. `_allspark._tcp.local.`.
    pub service_type: String,
    /// Listening port.
    pub port: u16,
    /// Whether the server speaks TLS.
    pub tls: bool,
}

impl Advertisement {
    fn properties(&self) -> HashMap<String, String> {
        let scheme = if self.tls { "wss" } else { "ws" };
        HashMap::from([
            ("scheme".to_owned(), scheme.to_owned()),
            ("path".to_owned(), "/".to_owned()),
        ])
    }
}

/// A registered mDNS service; unregistered by [`ServiceAdvertiser::shutdown`].
pub struct ServiceAdvertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl ServiceAdvertiser {
    /// Register the service on the first non-loopback IPv4 address.
    pub fn register(ad: &Advertisement) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new()?;
        let host = local_hostname();
        let ip = local_ipv4().to_string();

        let info = ServiceInfo::new(
            &ad.service_type,
            &ad.service_name,
            &format!("{host}.local."),
            ip.as_str(),
            ad.port,
            Some(ad.properties()),
        )?;
        let fullname = info.get_fullname().to_owned();
        daemon.register(info)?;

        info!(service = %fullname, %ip, port = ad.port, "advertising over mDNS");
        Ok(Self { daemon, fullname })
    }

    /// Unregister the service and stop the daemon.
    pub fn shutdown(self) {
        if let Err(err) = self.daemon.unregister(&self.fullname) {
            warn!(error = %err, "failed to unregister mDNS service");
        }
        if let Err(err) = self.daemon.shutdown() {
            debug!(error = %err, "mDNS daemon shutdown");
        }
        info!(service = %self.fullname, "mDNS advertisement stopped");
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.trim_end_matches(".local").to_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "perceptor".to_owned())
}

/// First non-loopback IPv4 address, found by asking the OS which interface
/// routes outward. No packet is sent.
pub fn local_ipv4() -> Ipv4Addr {
    let routed = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .ok()
        .map(|addr| addr.ip());

    match routed {
        Some(IpAddr::V4(ip)) if !ip.is_loopback() && !ip.is_unspecified() => ip,
        _ => Ipv4Addr::LOCALHOST,
    }
}
