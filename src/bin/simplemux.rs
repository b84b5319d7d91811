//! Command-line front end: parses the options, installs the logger and
//! runs the engine until a fatal error.

use anyhow::{anyhow, bail};
use simplemux::config::{Config, Flavor, Mode, RohcMode, TunnelMode, MAXPKTS};
use simplemux::logger;
use simplemux::MuxEngine;
use std::env;
use std::path::{Path, PathBuf};

#[cfg(not(target_os = "linux"))]
compile_error!("simplemux currently supports only Linux");

fn usage(progname: &str) {
    eprintln!(
        "Usage:\n\
         {progname} -i <ifacename> -e <ifacename> -c <peerIP> -M <'network' or 'udp' or 'tcpclient' or 'tcpserver'> \
         [-T 'tun' or 'tap'] [-f] [-b] [-p <port>] [-d <debug_level>] [-r <ROHC_option>] [-n <num_mux_tun>] \
         [-m <MTU>] [-B <num_bytes_threshold>] [-t <timeout>] [-P <period>] [-l <log file name>] [-L]\n\
         {progname} -h\n\
         \n\
         -i <ifacename>: name of the tun/tap interface for native packets (mandatory)\n\
         -e <ifacename>: name of the local interface for muxed packets (mandatory)\n\
         -c <peerIP>: IP address of the tunnel remote end (mandatory)\n\
         -M <mode>: 'network', 'udp', 'tcpserver' or 'tcpclient' (mandatory)\n\
         -T <tunnel mode>: 'tun' (default) or 'tap'\n\
         -f: fast flavor (lower compression rate, but faster). Compulsory for TCP\n\
         -b: blast flavor (packets are sent until an application-level ACK arrives). Requires -P\n\
         -p <port>: port to listen on and to connect to (default depends on the flavor)\n\
         -d <debug_level>: 0:none, 1:minimum, 2:medium, 3:maximum\n\
         -r <ROHC_option>: 0:no ROHC, 1:unidirectional, 2:bidirectional optimistic\n\
         -n <num_mux_tun>: packet count that triggers a muxed packet (max {MAXPKTS})\n\
         -m <MTU>: MTU of the network path (default: the one of the local interface)\n\
         -B <num_bytes_threshold>: size threshold in bytes that triggers a muxed packet\n\
         -t <timeout>: timeout (microseconds) that triggers a muxed packet\n\
         -P <period>: period (microseconds) that triggers a muxed packet\n\
         -l <log file name>: log file name; use 'stdout' for standard output\n\
         -L: use an automatic log file name (date and time)\n\
         -h: prints this help text"
    );
}

struct CliOptions {
    tun_name: Option<String>,
    mux_ifname: Option<String>,
    remote_ip: Option<std::net::Ipv4Addr>,
    mode: Option<Mode>,
    tunnel_mode: TunnelMode,
    fast: bool,
    blast: bool,
    port: Option<u16>,
    debug: u8,
    rohc: i32,
    limit: Option<usize>,
    mtu: Option<usize>,
    threshold: Option<usize>,
    timeout: Option<u64>,
    period: Option<u64>,
    log_path: Option<PathBuf>,
    auto_log: bool,
}

enum ParseOutcome {
    Run(Box<CliOptions>),
    Help,
}

impl CliOptions {
    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<ParseOutcome> {
        let mut options = CliOptions {
            tun_name: None,
            mux_ifname: None,
            remote_ip: None,
            mode: None,
            tunnel_mode: TunnelMode::Tun,
            fast: false,
            blast: false,
            port: None,
            debug: 0,
            rohc: 0,
            limit: None,
            mtu: None,
            threshold: None,
            timeout: None,
            period: None,
            log_path: None,
            auto_log: false,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" => return Ok(ParseOutcome::Help),
                "-f" => options.fast = true,
                "-b" => options.blast = true,
                "-L" => options.auto_log = true,
                "-i" => options.tun_name = Some(value(&mut args, "-i")?),
                "-e" => options.mux_ifname = Some(value(&mut args, "-e")?),
                "-c" => {
                    options.remote_ip = Some(
                        value(&mut args, "-c")?
                            .parse()
                            .map_err(|_| anyhow!("invalid peer IP address"))?,
                    )
                }
                "-M" => {
                    let mode = value(&mut args, "-M")?;
                    options.mode = Some(Mode::from_option(&mode).ok_or_else(|| {
                        anyhow!("'-M' must be 'network', 'udp', 'tcpserver' or 'tcpclient'")
                    })?);
                }
                "-T" => {
                    let tunnel = value(&mut args, "-T")?;
                    options.tunnel_mode = TunnelMode::from_option(&tunnel)
                        .ok_or_else(|| anyhow!("'-T' must be 'tun' or 'tap'"))?;
                }
                "-p" => options.port = Some(parsed(&mut args, "-p")?),
                "-d" => {
                    let level: i32 = parsed(&mut args, "-d")?;
                    options.debug = level.clamp(0, 3) as u8;
                }
                "-r" => options.rohc = parsed(&mut args, "-r")?,
                "-n" => options.limit = Some(parsed(&mut args, "-n")?),
                "-m" => options.mtu = Some(parsed(&mut args, "-m")?),
                "-B" => options.threshold = Some(parsed(&mut args, "-B")?),
                "-t" => options.timeout = Some(parsed(&mut args, "-t")?),
                "-P" => options.period = Some(parsed(&mut args, "-P")?),
                "-l" => options.log_path = Some(PathBuf::from(value(&mut args, "-l")?)),
                other => bail!("unknown option '{other}'"),
            }
        }
        Ok(ParseOutcome::Run(Box::new(options)))
    }

    fn into_config(self) -> anyhow::Result<Config> {
        let flavor = match (self.fast, self.blast) {
            (true, true) => bail!("blast flavor (-b) and fast flavor (-f) are not compatible"),
            (true, false) => Flavor::Fast,
            (false, true) => Flavor::Blast,
            (false, false) => Flavor::Normal,
        };

        let mut config = Config::new(flavor);
        config.tun_name = self
            .tun_name
            .ok_or_else(|| anyhow!("must specify a tun/tap interface name ('-i' option)"))?;
        config.mux_ifname = self
            .mux_ifname
            .ok_or_else(|| anyhow!("must specify the local interface name ('-e' option)"))?;
        config.remote_ip = self
            .remote_ip
            .ok_or_else(|| anyhow!("must specify the IP address of the peer ('-c' option)"))?;
        config.mode = self
            .mode
            .ok_or_else(|| anyhow!("must specify a mode ('-M' option)"))?;
        config.tunnel_mode = self.tunnel_mode;
        config.rohc_mode = RohcMode::from_level(self.rohc);

        if let Some(port) = self.port {
            config.port = port;
            config.feedback_port = port
                .checked_add(1)
                .ok_or_else(|| anyhow!("port {port} leaves no room for the feedback port"))?;
        }
        if let Some(limit) = self.limit {
            if limit == 0 || limit > MAXPKTS {
                bail!("'-n' must be between 1 and {MAXPKTS}");
            }
            config.limit_num_packets = Some(limit);
        }
        config.user_mtu = self.mtu;
        config.size_threshold = self.threshold;
        config.timeout_us = self.timeout;
        config.period_us = self.period;

        config.validate()?;
        Ok(config)
    }
}

fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<String> {
    args.next()
        .ok_or_else(|| anyhow!("option '{flag}' requires a value"))
}

fn parsed<T: std::str::FromStr>(
    args: &mut impl Iterator<Item = String>,
    flag: &str,
) -> anyhow::Result<T> {
    value(args, flag)?
        .parse()
        .map_err(|_| anyhow!("invalid value for option '{flag}'"))
}

fn main() -> anyhow::Result<()> {
    let progname = env::args().next().unwrap_or_else(|| "simplemux".into());
    let arguments: Vec<String> = env::args().skip(1).collect();
    if arguments.is_empty() {
        usage(&progname);
        bail!("no options given");
    }

    let options = match CliOptions::parse(arguments.into_iter()) {
        Ok(ParseOutcome::Run(options)) => options,
        Ok(ParseOutcome::Help) => {
            usage(&progname);
            return Ok(());
        }
        Err(err) => {
            usage(&progname);
            return Err(err);
        }
    };

    logger::set_verbosity(options.debug);
    logger::debug(
        1,
        logger::TraceFlags::ALL,
        format!("debug level set to {}", options.debug),
    );

    if let Some(path) = options.log_path.clone() {
        logger::install_event_log(&path)?;
    } else if options.auto_log {
        let name = chrono::Local::now().format("%Y-%m-%d_%H.%M.%S.log").to_string();
        logger::install_event_log(Path::new(&name))?;
    }

    let config = options.into_config()?;
    if config.rohc_mode.is_enabled() {
        bail!(
            "ROHC modes (-r) need a header-compression engine; none is built into this binary"
        );
    }

    let mut engine = MuxEngine::new(config)?;
    engine.run()
}
