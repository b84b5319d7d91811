#![deny(unsafe_op_in_unsafe_fn)]

//! Simplemux multiplexes many small IP packets or Ethernet frames from a
//! tun/tap interface into single outer datagrams sent to a peer, and
//! demultiplexes the reverse direction. Bundles travel over raw IPv4, UDP
//! or a single TCP connection, in one of three wire flavors: Normal
//! (compact variable-width separators), Fast (fixed 3-byte separators,
//! required for TCP) and Blast (one packet per datagram, retransmitted
//! until an application-level ACK arrives).

pub mod blast;
pub mod config;
pub mod context;
pub mod demux;
pub mod logger;
pub mod mux;
pub mod rohc;
pub mod scheduler;
pub mod separator;
pub mod transport;
pub mod tun;

pub use config::{Config, ConfigError, Flavor, Mode, RohcMode, TunnelMode};
pub use context::{Context, Counters};
pub use rohc::{DecompressOutcome, RohcCodec, RohcError};

/// Owns the datapath state and runs the readiness loop.
pub struct MuxEngine {
    context: Context,
}

impl MuxEngine {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        Self::with_codec(config, None)
    }

    /// Builds the engine with an external ROHC engine installed.
    pub fn with_rohc(config: Config, codec: Box<dyn RohcCodec>) -> anyhow::Result<Self> {
        Self::with_codec(config, Some(codec))
    }

    fn with_codec(config: Config, rohc: Option<Box<dyn RohcCodec>>) -> anyhow::Result<Self> {
        if config.rohc_mode.is_enabled() && rohc.is_none() {
            anyhow::bail!("a ROHC mode was selected but no compression engine is installed");
        }
        Ok(Self {
            context: Context::new(config, rohc)?,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Runs the readiness loop. Returns only on a fatal I/O error; there
    /// is no cancellation, process termination closes the sockets.
    pub fn run(&mut self) -> anyhow::Result<()> {
        scheduler::run(&mut self.context)
    }
}
