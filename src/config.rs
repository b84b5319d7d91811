//! Run configuration: modes, flavors, wire constants, option validation and
//! the derived multiplexing policy.

use std::net::Ipv4Addr;
use thiserror::Error;

/// Buffer for reading from the tun/tap interface; must be >= the path MTU.
pub const BUFSIZE: usize = 2304;

pub const IPV4_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;
/// The outer TCP header is assumed to carry common options (32 bytes, not 20).
pub const TCP_HEADER_SIZE: usize = 32;

// Protocol IDs, according to IANA
// see https://www.iana.org/assignments/protocol-numbers/protocol-numbers.xhtml
pub const IPPROTO_IP_ON_IP: u8 = 4;
pub const IPPROTO_ROHC: u8 = 142;
pub const IPPROTO_ETHERNET: u8 = 143;

// Outer raw-IPv4 protocol numbers (experimental range), one per flavor.
pub const IPPROTO_SIMPLEMUX: u8 = 253;
pub const IPPROTO_SIMPLEMUX_FAST: u8 = 254;
pub const IPPROTO_SIMPLEMUX_BLAST: u8 = 252;

pub const PORT: u16 = 55555;
pub const PORT_FEEDBACK: u16 = 55556;
pub const PORT_FAST: u16 = 55557;
pub const PORT_BLAST: u16 = 55558;

/// Maximum number of packets stored in a pending bundle.
pub const MAXPKTS: usize = 100;

/// Maximum value of the timeout and the period, in microseconds (100 s).
pub const MAXTIMEOUT: u64 = 100_000_000;

/// A blast heartbeat is sent every second.
pub const HEARTBEAT_PERIOD: u64 = 1_000_000;
/// If no heartbeat has arrived for this long, blast delivery is hopeless and
/// new packets are not retained for resending.
pub const HEARTBEAT_DEADLINE: u64 = 5_000_000;
/// A blast identifier may be delivered again once this many microseconds
/// have passed since its previous delivery.
pub const TIME_UNTIL_SENDING_AGAIN_BLAST: u64 = 5_000_000;

/// Initial TTL of outgoing raw IPv4 packets.
pub const LINUX_TTL: u8 = 64;

/// Outer transport carrying the multiplexed bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Network,
    Udp,
    TcpServer,
    TcpClient,
}

impl Mode {
    pub fn from_option(value: &str) -> Option<Self> {
        match value {
            "network" => Some(Mode::Network),
            "udp" => Some(Mode::Udp),
            "tcpserver" => Some(Mode::TcpServer),
            "tcpclient" => Some(Mode::TcpClient),
            _ => None,
        }
    }

    pub fn is_tcp(self) -> bool {
        matches!(self, Mode::TcpServer | Mode::TcpClient)
    }

    /// Bytes of outer header that the transport prepends to a bundle.
    pub fn outer_header_size(self) -> usize {
        match self {
            Mode::Network => IPV4_HEADER_SIZE,
            Mode::Udp => IPV4_HEADER_SIZE + UDP_HEADER_SIZE,
            Mode::TcpServer | Mode::TcpClient => IPV4_HEADER_SIZE + TCP_HEADER_SIZE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Network => "network",
            Mode::Udp => "udp",
            Mode::TcpServer => "tcpserver",
            Mode::TcpClient => "tcpclient",
        }
    }
}

/// Whether the inner interface carries L3 packets (tun) or L2 frames (tap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    Tun,
    Tap,
}

impl TunnelMode {
    pub fn from_option(value: &str) -> Option<Self> {
        match value {
            "tun" => Some(TunnelMode::Tun),
            "tap" => Some(TunnelMode::Tap),
            _ => None,
        }
    }

    /// Protocol ID used for uncompressed inner packets in this mode.
    pub fn native_protocol(self) -> u8 {
        match self {
            TunnelMode::Tun => IPPROTO_IP_ON_IP,
            TunnelMode::Tap => IPPROTO_ETHERNET,
        }
    }
}

/// Wire dialect of the bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Normal,
    Fast,
    Blast,
}

impl Flavor {
    pub fn default_port(self) -> u16 {
        match self {
            Flavor::Normal => PORT,
            Flavor::Fast => PORT_FAST,
            Flavor::Blast => PORT_BLAST,
        }
    }

    /// Protocol number of the outer raw-IPv4 packets.
    pub fn outer_protocol(self) -> u8 {
        match self {
            Flavor::Normal => IPPROTO_SIMPLEMUX,
            Flavor::Fast => IPPROTO_SIMPLEMUX_FAST,
            Flavor::Blast => IPPROTO_SIMPLEMUX_BLAST,
        }
    }
}

/// ROHC header-compression mode of the local decompressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RohcMode {
    Off,
    Unidirectional,
    Optimistic,
}

impl RohcMode {
    /// Numeric CLI values 0..=2; larger values clamp to Optimistic.
    pub fn from_level(level: i32) -> Self {
        match level {
            i32::MIN..=0 => RohcMode::Off,
            1 => RohcMode::Unidirectional,
            _ => RohcMode::Optimistic,
        }
    }

    pub fn is_enabled(self) -> bool {
        self != RohcMode::Off
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("TCP server and TCP client modes require the fast flavor")]
    TcpRequiresFast,
    #[error("blast flavor is not allowed over TCP")]
    BlastOverTcp,
    #[error("blast flavor is not compatible with ROHC")]
    BlastWithRohc,
    #[error("blast flavor is not compatible with a size threshold")]
    BlastWithSizeThreshold,
    #[error("blast flavor is not compatible with a timeout")]
    BlastWithTimeout,
    #[error("blast flavor is not compatible with a packet-count limit")]
    BlastWithCountLimit,
    #[error("blast flavor requires a period")]
    BlastNeedsPeriod,
    #[error("ROHC cannot be used in tap mode (Ethernet headers cannot be compressed)")]
    RohcInTapMode,
    #[error("the requested MTU {user} is higher than the interface MTU {interface}")]
    MtuAboveInterface { user: usize, interface: usize },
    #[error("the selected MTU {0} is higher than the packet buffer ({BUFSIZE} bytes)")]
    MtuAboveBuffer(usize),
}

/// Parsed command-line options, before the MTU-dependent policy is derived.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the tun/tap interface carrying native packets.
    pub tun_name: String,
    /// Name of the local interface whose address receives muxed packets.
    pub mux_ifname: String,
    /// Tunnel remote end.
    pub remote_ip: Ipv4Addr,
    pub mode: Mode,
    pub tunnel_mode: TunnelMode,
    pub flavor: Flavor,
    pub rohc_mode: RohcMode,
    /// Port for muxed packets; also the remote port.
    pub port: u16,
    /// Port of the ROHC feedback channel, both ends.
    pub feedback_port: u16,
    /// MTU forced by the user; must not exceed the interface MTU.
    pub user_mtu: Option<usize>,
    /// `-n`: packet-count trigger.
    pub limit_num_packets: Option<usize>,
    /// `-B`: size trigger in bytes, clamped to sizeMax at derivation.
    pub size_threshold: Option<usize>,
    /// `-t`: timeout trigger in microseconds.
    pub timeout_us: Option<u64>,
    /// `-P`: period in microseconds.
    pub period_us: Option<u64>,
}

impl Config {
    /// Starting point for a given flavor; the caller fills in interfaces,
    /// peer, mode and triggers.
    pub fn new(flavor: Flavor) -> Self {
        Config {
            tun_name: String::new(),
            mux_ifname: String::new(),
            remote_ip: Ipv4Addr::UNSPECIFIED,
            mode: Mode::Udp,
            tunnel_mode: TunnelMode::Tun,
            flavor,
            rohc_mode: RohcMode::Off,
            port: flavor.default_port(),
            feedback_port: PORT_FEEDBACK,
            user_mtu: None,
            limit_num_packets: None,
            size_threshold: None,
            timeout_us: None,
            period_us: None,
        }
    }

    /// Checks the option compatibility matrix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode.is_tcp() && self.flavor == Flavor::Normal {
            return Err(ConfigError::TcpRequiresFast);
        }
        if self.flavor == Flavor::Blast {
            if self.mode.is_tcp() {
                return Err(ConfigError::BlastOverTcp);
            }
            if self.rohc_mode.is_enabled() {
                return Err(ConfigError::BlastWithRohc);
            }
            if self.size_threshold.is_some() {
                return Err(ConfigError::BlastWithSizeThreshold);
            }
            if self.timeout_us.is_some() {
                return Err(ConfigError::BlastWithTimeout);
            }
            if self.limit_num_packets.is_some() {
                return Err(ConfigError::BlastWithCountLimit);
            }
            if self.period_us.is_none() {
                return Err(ConfigError::BlastNeedsPeriod);
            }
        }
        if self.tunnel_mode == TunnelMode::Tap && self.rohc_mode.is_enabled() {
            return Err(ConfigError::RohcInTapMode);
        }
        Ok(())
    }

    /// Resolves the MTU to use, validating the user request against the
    /// interface MTU and the packet buffer.
    pub fn select_mtu(&self, interface_mtu: usize) -> Result<usize, ConfigError> {
        let selected = match self.user_mtu {
            Some(user) if user > interface_mtu => {
                return Err(ConfigError::MtuAboveInterface {
                    user,
                    interface: interface_mtu,
                })
            }
            Some(user) => user,
            None => interface_mtu,
        };
        if selected > BUFSIZE {
            return Err(ConfigError::MtuAboveBuffer(selected));
        }
        Ok(selected)
    }
}

/// Triggering parameters of the bundle assembler, derived from the options
/// and the selected MTU.
#[derive(Debug, Clone, Copy)]
pub struct MuxPolicy {
    /// Flush once this many packets are stored.
    pub limit_num_packets: usize,
    /// Flush once the pending bundle reaches this many bytes.
    pub size_threshold: usize,
    /// Flush on arrival if this long has passed since the last send (us).
    pub timeout_us: u64,
    /// Flush pending packets when the scheduler has been idle this long (us).
    pub period_us: u64,
    /// Hard bound on bundle payload bytes: MTU minus the outer header.
    pub size_max: usize,
}

impl MuxPolicy {
    pub fn derive(config: &Config, selected_mtu: usize) -> Self {
        let size_max = selected_mtu.saturating_sub(config.mode.outer_header_size());
        let size_threshold = match config.size_threshold {
            Some(user) if user > size_max => {
                crate::logger::warn(format!(
                    "size threshold too big: {user}. Automatically set to the maximum: {size_max}"
                ));
                size_max
            }
            Some(user) => user,
            None => size_max,
        };
        let timeout_us = config.timeout_us.unwrap_or(MAXTIMEOUT).min(MAXTIMEOUT);
        let period_us = config.period_us.unwrap_or(MAXTIMEOUT).min(MAXTIMEOUT);

        // With no user-selected trigger at all, every packet leaves
        // immediately; with any trigger set, an unset count limit defaults
        // to the storage maximum.
        let any_trigger_set = config.size_threshold.is_some()
            || config.timeout_us.is_some()
            || config.period_us.is_some();
        let limit_num_packets = match config.limit_num_packets {
            Some(n) => n.clamp(1, MAXPKTS),
            None if any_trigger_set => MAXPKTS,
            None => 1,
        };

        MuxPolicy {
            limit_num_packets,
            size_threshold,
            timeout_us,
            period_us,
            size_max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(flavor: Flavor) -> Config {
        let mut config = Config::new(flavor);
        config.tun_name = "tun0".into();
        config.mux_ifname = "eth0".into();
        config.remote_ip = Ipv4Addr::new(192, 168, 0, 2);
        config
    }

    #[test]
    fn tcp_modes_require_fast() {
        let mut config = base_config(Flavor::Normal);
        config.mode = Mode::TcpClient;
        assert_eq!(config.validate(), Err(ConfigError::TcpRequiresFast));

        config.flavor = Flavor::Fast;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn blast_restrictions() {
        let mut config = base_config(Flavor::Blast);
        assert_eq!(config.validate(), Err(ConfigError::BlastNeedsPeriod));

        config.period_us = Some(100_000);
        assert_eq!(config.validate(), Ok(()));

        config.rohc_mode = RohcMode::Unidirectional;
        assert_eq!(config.validate(), Err(ConfigError::BlastWithRohc));
        config.rohc_mode = RohcMode::Off;

        config.timeout_us = Some(1_000);
        assert_eq!(config.validate(), Err(ConfigError::BlastWithTimeout));
        config.timeout_us = None;

        config.mode = Mode::TcpServer;
        assert_eq!(config.validate(), Err(ConfigError::BlastOverTcp));
    }

    #[test]
    fn rohc_rejected_in_tap_mode() {
        let mut config = base_config(Flavor::Normal);
        config.tunnel_mode = TunnelMode::Tap;
        config.rohc_mode = RohcMode::Optimistic;
        assert_eq!(config.validate(), Err(ConfigError::RohcInTapMode));
    }

    #[test]
    fn mtu_selection() {
        let mut config = base_config(Flavor::Normal);
        assert_eq!(config.select_mtu(1500), Ok(1500));

        config.user_mtu = Some(1400);
        assert_eq!(config.select_mtu(1500), Ok(1400));

        config.user_mtu = Some(1600);
        assert_eq!(
            config.select_mtu(1500),
            Err(ConfigError::MtuAboveInterface {
                user: 1600,
                interface: 1500
            })
        );

        config.user_mtu = Some(3000);
        assert_eq!(config.select_mtu(4000), Err(ConfigError::MtuAboveBuffer(3000)));
    }

    #[test]
    fn policy_defaults_to_immediate_send() {
        let config = base_config(Flavor::Normal);
        let policy = MuxPolicy::derive(&config, 1500);
        assert_eq!(policy.limit_num_packets, 1);
        assert_eq!(policy.size_max, 1500 - IPV4_HEADER_SIZE - UDP_HEADER_SIZE);
        assert_eq!(policy.size_threshold, policy.size_max);
        assert_eq!(policy.timeout_us, MAXTIMEOUT);
        assert_eq!(policy.period_us, MAXTIMEOUT);
    }

    #[test]
    fn policy_count_limit_defaults_to_max_when_other_trigger_set() {
        let mut config = base_config(Flavor::Normal);
        config.period_us = Some(50_000);
        let policy = MuxPolicy::derive(&config, 1500);
        assert_eq!(policy.limit_num_packets, MAXPKTS);
    }

    #[test]
    fn policy_clamps_threshold_to_size_max() {
        let mut config = base_config(Flavor::Normal);
        config.mode = Mode::Network;
        config.size_threshold = Some(10_000);
        let policy = MuxPolicy::derive(&config, 1500);
        assert_eq!(policy.size_threshold, 1500 - IPV4_HEADER_SIZE);
        // Setting a threshold counts as a trigger, so the count limit is MAXPKTS.
        assert_eq!(policy.limit_num_packets, MAXPKTS);
    }
}
