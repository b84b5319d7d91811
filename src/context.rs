//! Shared configuration and mutable state owned by the scheduler thread.

use crate::blast::BlastTracker;
use crate::config::{Config, Flavor, MuxPolicy};
use crate::logger::{self, TraceFlags};
use crate::mux::BundleAssembler;
use crate::rohc::RohcCodec;
use crate::transport::{self, OuterTransport};
use crate::tun::TunDevice;
use anyhow::Context as _;
use std::net::{SocketAddrV4, UdpSocket};

/// Packet counters, snapshotted for reporting.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    /// Packets read from the inner interface.
    pub tun2net: u32,
    /// Multiplexed packets read from the network.
    pub net2tun: u32,
    /// ROHC feedback packets received.
    pub feedback_pkts: u32,
    pub oversized_dropped: u64,
    pub malformed_bundles: u64,
    pub rohc_failures: u64,
    pub blast_duplicates_suppressed: u64,
}

/// Everything the readiness loop works on. Exclusively owned by the
/// scheduler; components borrow it mutably, one at a time.
pub struct Context {
    pub config: Config,
    pub policy: MuxPolicy,
    pub selected_mtu: usize,
    pub tun: TunDevice,
    pub transport: OuterTransport,
    pub feedback_socket: UdpSocket,
    pub feedback_remote: SocketAddrV4,
    pub assembler: BundleAssembler,
    pub blast: BlastTracker,
    pub rohc: Option<Box<dyn RohcCodec>>,
    /// Timestamp (us) of the last bundle sent; anchors timeout and period.
    pub time_last_sent: u64,
    pub counters: Counters,
}

impl Context {
    /// Opens the devices and sockets and derives the policy. Fails fast on
    /// invalid option combinations.
    pub fn new(config: Config, rohc: Option<Box<dyn RohcCodec>>) -> anyhow::Result<Self> {
        config.validate()?;

        let tun = TunDevice::open(&config.tun_name, config.tunnel_mode).with_context(|| {
            format!(
                "could not connect to interface {} for native packets",
                config.tun_name
            )
        })?;
        logger::debug(
            1,
            TraceFlags::NATIVE,
            format!(
                "Successfully connected to interface for native packets {}",
                tun.name()
            ),
        );

        let local_ip = transport::interface_ipv4(&config.mux_ifname).with_context(|| {
            format!("could not find the IPv4 address of {}", config.mux_ifname)
        })?;
        let interface_mtu = transport::interface_mtu(&config.mux_ifname)
            .with_context(|| format!("could not read the MTU of {}", config.mux_ifname))?;
        let selected_mtu = config.select_mtu(interface_mtu)?;
        logger::debug(
            1,
            TraceFlags::MUX,
            format!("Local interface MTU: {interface_mtu}. Selected MTU: {selected_mtu}"),
        );

        let policy = MuxPolicy::derive(&config, selected_mtu);
        logger::debug(
            1,
            TraceFlags::MUX,
            format!(
                "Multiplexing policies: size threshold: {}. numpackets: {}. timeout: {}us. period: {}us",
                policy.size_threshold,
                policy.limit_num_packets,
                policy.timeout_us,
                policy.period_us
            ),
        );

        let transport = OuterTransport::open(&config, local_ip)
            .context("could not open the socket for muxed packets")?;
        logger::debug(
            1,
            TraceFlags::POLL,
            format!(
                "Socket for multiplexing open ({} mode). Local IP {local_ip}. Remote IP {}",
                config.mode.as_str(),
                config.remote_ip
            ),
        );

        let feedback_socket = transport::open_feedback_socket(local_ip, config.feedback_port)
            .context("could not open the ROHC feedback socket")?;
        let feedback_remote = SocketAddrV4::new(config.remote_ip, config.feedback_port);

        let now = logger::timestamp_us();
        let mut blast = BlastTracker::new();
        blast.start_clock(now);

        let assembler = BundleAssembler::new(
            match config.flavor {
                // The assembler never runs in blast; give it a harmless shape.
                Flavor::Blast => Flavor::Normal,
                flavor => flavor,
            },
            policy,
        );

        Ok(Self {
            config,
            policy,
            selected_mtu,
            tun,
            transport,
            feedback_socket,
            feedback_remote,
            assembler,
            blast,
            rohc,
            time_last_sent: now,
            counters: Counters::default(),
        })
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }
}
