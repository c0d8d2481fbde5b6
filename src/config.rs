use chrono::Local;
use pnet::util::MacAddr;
use serde::Deserialize;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::Path;
use std::path::PathBuf;

use crate::DEFAULT_SNAPLEN;
use crate::frame::DEFAULT_MASK_KEY;
use crate::pcap::PcapByteOrder;

static DEFAULT_CLIENT_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
// Stands in for the remote host, which is never resolved.
static DEFAULT_SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
static DEFAULT_CLIENT_ISN: u32 = 1000;
static DEFAULT_SERVER_ISN: u32 = 2000;
static DEFAULT_TTL: u8 = 64;
static DEFAULT_WINDOW: u16 = 65535;

static SESSION_FILE_PREFIX: &str = "session";
static SESSION_ID_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Addressing and header constants for one synthetic capture session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Hostname of the remote endpoint, for display only.
    pub server_host: String,
    pub client_ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,
    pub client_mac: MacAddr,
    pub server_mac: MacAddr,
    pub client_port: u16,
    pub server_port: u16,
    /// Initial sequence numbers, the SYN of each side carries these.
    pub client_isn: u32,
    pub server_isn: u32,
    pub first_ip_id: u16,
    pub ttl: u8,
    pub window: u16,
    /// Key used to mask every client to server frame.
    pub mask_key: [u8; 4],
    pub byte_order: PcapByteOrder,
    pub snaplen: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            server_host: DEFAULT_SERVER_IP.to_string(),
            client_ip: DEFAULT_CLIENT_IP,
            server_ip: DEFAULT_SERVER_IP,
            client_mac: MacAddr::zero(),
            server_mac: MacAddr::zero(),
            client_port: 0,
            server_port: default_server_port("ws"),
            client_isn: DEFAULT_CLIENT_ISN,
            server_isn: DEFAULT_SERVER_ISN,
            first_ip_id: 1,
            ttl: DEFAULT_TTL,
            window: DEFAULT_WINDOW,
            mask_key: DEFAULT_MASK_KEY,
            byte_order: PcapByteOrder::BigEndian,
            snaplen: DEFAULT_SNAPLEN,
        }
    }
}

impl CaptureConfig {
    /// Config for a proxied connection to `server_host`.
    /// ```rust
    /// use wscapture::CaptureConfig;
    ///
    /// let config = CaptureConfig::new("example.com", 5000, 80);
    /// assert_eq!(config.server_host, "example.com");
    /// assert_eq!(config.server_ip.to_string(), "192.168.1.100");
    /// ```
    pub fn new(server_host: &str, client_port: u16, server_port: u16) -> CaptureConfig {
        CaptureConfig {
            server_host: server_host.to_string(),
            client_port,
            server_port,
            ..CaptureConfig::default()
        }
    }
    /// The host is kept for display, the server address stays fabricated.
    pub fn server_host(&mut self, server_host: &str) -> &mut Self {
        self.server_host = server_host.to_string();
        self
    }
    pub fn client_port(&mut self, client_port: u16) -> &mut Self {
        self.client_port = client_port;
        self
    }
    pub fn server_port(&mut self, server_port: u16) -> &mut Self {
        self.server_port = server_port;
        self
    }
    pub fn client_ip(&mut self, client_ip: Ipv4Addr) -> &mut Self {
        self.client_ip = client_ip;
        self
    }
    pub fn server_ip(&mut self, server_ip: Ipv4Addr) -> &mut Self {
        self.server_ip = server_ip;
        self
    }
    pub fn byte_order(&mut self, pbo: PcapByteOrder) -> &mut Self {
        self.byte_order = pbo;
        self
    }
    pub fn initial_sequence(&mut self, client_isn: u32, server_isn: u32) -> &mut Self {
        self.client_isn = client_isn;
        self.server_isn = server_isn;
        self
    }
}

/// Port used when the upstream url has none.
pub fn default_server_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("wss") {
        443
    } else {
        80
    }
}

/// Session id derived from the local time the proxy started.
pub fn new_session_id() -> String {
    Local::now().format(SESSION_ID_FORMAT).to_string()
}

/// `<dir>/session_<session_id>_conn_<connection_id>.pcap`
pub fn session_file_name<P: AsRef<Path>>(dir: P, session_id: &str, connection_id: u32) -> PathBuf {
    let name = format!("{SESSION_FILE_PREFIX}_{session_id}_conn_{connection_id}.pcap");
    dir.as_ref().join(name)
}
