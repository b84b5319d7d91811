//! The readiness loop: a single `poll(2)` over the inner interface, the
//! feedback socket and the outer socket, plus the period timer.
//!
//! One readiness source is serviced per iteration, outer side first. Every
//! handler returns promptly; the only blocking waits are the poll itself
//! and the blocking send paths inside the transport.

use crate::blast::BlastInbound;
use crate::config::{Flavor, Mode, TunnelMode, BUFSIZE, IPPROTO_ETHERNET, IPPROTO_ROHC};
use crate::context::Context;
use crate::demux;
use crate::logger::{self, TraceFlags};
use crate::mux::{AcceptOutcome, Bundle, FlushReason};
use crate::separator::BLAST_HEADER_SIZE;
use crate::transport::Inbound;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;

enum Readiness {
    Tun,
    Feedback,
    Outer,
    Timeout,
}

/// Runs the loop until a fatal error surfaces. Does not return otherwise.
pub fn run(ctx: &mut Context) -> anyhow::Result<()> {
    logger::debug(3, TraceFlags::POLL, "entering the readiness loop");
    loop {
        let now = logger::timestamp_us();
        let wait_us = compute_wait(ctx, now);
        match wait_readable(ctx, wait_us)? {
            Readiness::Outer => handle_outer(ctx)?,
            Readiness::Feedback => handle_feedback(ctx)?,
            Readiness::Tun => handle_tun(ctx)?,
            Readiness::Timeout => handle_period(ctx)?,
        }
    }
}

/// How long the poll may sleep before the period path must run.
fn compute_wait(ctx: &Context, now: u64) -> u64 {
    match ctx.config.flavor {
        Flavor::Blast => ctx.blast.next_wake_us(now, ctx.policy.period_us),
        _ => ctx
            .policy
            .period_us
            .saturating_sub(now.saturating_sub(ctx.time_last_sent)),
    }
}

fn wait_readable(ctx: &Context, wait_us: u64) -> io::Result<Readiness> {
    let mut fds = [
        libc::pollfd {
            fd: ctx.tun.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: ctx.feedback_socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: ctx.transport.pollable_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    let timeout_ms = (wait_us / 1000).min(i32::MAX as u64) as libc::c_int;

    loop {
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if ready == 0 {
            return Ok(Readiness::Timeout);
        }
        // Error and hangup conditions surface through the read on the
        // corresponding fd.
        let readable = libc::POLLIN | libc::POLLERR | libc::POLLHUP;
        if fds[2].revents & readable != 0 {
            return Ok(Readiness::Outer);
        }
        if fds[1].revents & readable != 0 {
            return Ok(Readiness::Feedback);
        }
        if fds[0].revents & readable != 0 {
            return Ok(Readiness::Tun);
        }
        return Ok(Readiness::Timeout);
    }
}

/// Data (or a connection request) arrived on the outer side.
fn handle_outer(ctx: &mut Context) -> anyhow::Result<()> {
    if ctx.transport.awaiting_accept() {
        ctx.transport.accept_client()?;
        return Ok(());
    }

    let mut scratch = [0u8; BUFSIZE];
    match ctx.transport.recv(&mut scratch)? {
        Inbound::Pending => {}
        Inbound::PassThrough(bytes) => {
            logger::debug(
                1,
                TraceFlags::DEMUX,
                format!(
                    "NON-SIMPLEMUX PACKET #{}: writing {} bytes to {}",
                    ctx.counters.net2tun,
                    bytes.len(),
                    ctx.tun.name()
                ),
            );
            if let Err(err) = ctx.tun.write_packet(&bytes) {
                logger::error(format!("could not forward a non-multiplexed packet: {err}"));
            }
            logger::event(format_args!(
                "{}\tforward\tnative\t{}\t{}\tfrom\t{}\t{}",
                logger::timestamp_us(),
                bytes.len(),
                ctx.counters.net2tun,
                ctx.config.remote_ip,
                ctx.config.port
            ));
        }
        Inbound::Packet { protocol, payload } => {
            ctx.counters.net2tun = ctx.counters.net2tun.wrapping_add(1);
            logger::event(format_args!(
                "{}\trec\tmuxed\t{}\t{}\tfrom\t{}\t{}",
                logger::timestamp_us(),
                payload.len(),
                ctx.counters.net2tun,
                ctx.config.remote_ip,
                ctx.config.port
            ));
            deliver_inner(ctx, protocol, &payload)?;
        }
        Inbound::Muxed(bundle) => {
            ctx.counters.net2tun = ctx.counters.net2tun.wrapping_add(1);
            logger::event(format_args!(
                "{}\trec\tmuxed\t{}\t{}\tfrom\t{}\t{}",
                logger::timestamp_us(),
                bundle.len(),
                ctx.counters.net2tun,
                ctx.config.remote_ip,
                remote_port_field(ctx)
            ));
            if ctx.config.flavor == Flavor::Blast {
                handle_blast_datagram(ctx, &bundle)?;
            } else {
                demux_bundle(ctx, &bundle)?;
            }
        }
    }
    Ok(())
}

fn demux_bundle(ctx: &mut Context, bundle: &[u8]) -> anyhow::Result<()> {
    match demux::parse_bundle(ctx.config.flavor, bundle) {
        Ok(packets) => {
            logger::debug(
                1,
                TraceFlags::DEMUX,
                format!(
                    "MUXED PACKET #{}: {} bytes, {} packets",
                    ctx.counters.net2tun,
                    bundle.len(),
                    packets.len()
                ),
            );
            for (protocol, packet) in packets {
                deliver_inner(ctx, protocol, &packet)?;
            }
            Ok(())
        }
        Err(err) => {
            ctx.counters.malformed_bundles += 1;
            logger::error(format!("could not demux a received bundle: {err}"));
            logger::event(format_args!(
                "{}\tdrop\tmalformed\t{}\t{}",
                logger::timestamp_us(),
                bundle.len(),
                ctx.counters.net2tun
            ));
            Ok(())
        }
    }
}

/// Hands one demultiplexed packet to the inner interface, decompressing
/// ROHC packets on the way.
fn deliver_inner(ctx: &mut Context, protocol: u8, payload: &[u8]) -> anyhow::Result<()> {
    if protocol == IPPROTO_ROHC {
        if ctx.rohc.is_none() {
            ctx.counters.rohc_failures += 1;
            logger::debug(
                1,
                TraceFlags::DEMUX,
                "ROHC packet received but ROHC is not activated; dropping",
            );
            return Ok(());
        }

        let outcome = match ctx.rohc.as_mut() {
            Some(codec) => codec.decompress(payload),
            None => return Ok(()),
        };
        match outcome {
            Ok(outcome) => {
                if let Some(feedback) = outcome.received_feedback {
                    if let Some(codec) = ctx.rohc.as_mut() {
                        if let Err(err) = codec.deliver_feedback(&feedback) {
                            logger::debug(
                                3,
                                TraceFlags::FEEDBACK,
                                format!("error delivering piggybacked feedback: {err}"),
                            );
                        }
                    }
                }
                if let Some(feedback) = outcome.feedback_to_send {
                    if let Err(err) = ctx
                        .feedback_socket
                        .send_to(&feedback, ctx.feedback_remote)
                    {
                        logger::error(format!("could not send ROHC feedback: {err}"));
                    }
                }
                match outcome.packet {
                    Some(packet) => write_inner(ctx, &packet),
                    None => {
                        logger::debug(
                            2,
                            TraceFlags::DEMUX,
                            "feedback-only ROHC packet; nothing to deliver",
                        );
                    }
                }
            }
            Err(err) => {
                ctx.counters.rohc_failures += 1;
                logger::debug(1, TraceFlags::DEMUX, format!("decompression failed: {err}"));
                logger::event(format_args!(
                    "{}\tdrop\trohc\t{}\t{}",
                    logger::timestamp_us(),
                    payload.len(),
                    ctx.counters.net2tun
                ));
            }
        }
        return Ok(());
    }

    write_inner(ctx, payload);
    Ok(())
}

fn write_inner(ctx: &mut Context, packet: &[u8]) {
    match ctx.tun.write_packet(packet) {
        Ok(()) => {
            logger::debug(
                2,
                TraceFlags::DEMUX,
                format!("  sending packet of {} bytes to {}", packet.len(), ctx.tun.name()),
            );
            logger::event(format_args!(
                "{}\tsent\tdemuxed\t{}\t{}",
                logger::timestamp_us(),
                packet.len(),
                ctx.counters.net2tun
            ));
        }
        Err(err) => {
            logger::error(format!(
                "could not write the packet to {}: {err}",
                ctx.tun.name()
            ));
        }
    }
}

/// Feedback (or stray traffic) arrived on the feedback socket.
fn handle_feedback(ctx: &mut Context) -> anyhow::Result<()> {
    let mut buf = [0u8; BUFSIZE];
    let (nread, source) = ctx.feedback_socket.recv_from(&mut buf)?;
    let payload = &buf[..nread];

    let from_feedback_port =
        matches!(source, SocketAddr::V4(addr) if addr.port() == ctx.config.feedback_port);
    if from_feedback_port {
        ctx.counters.feedback_pkts = ctx.counters.feedback_pkts.wrapping_add(1);
        logger::debug(
            1,
            TraceFlags::FEEDBACK,
            format!(
                "FEEDBACK {}: read ROHC feedback packet ({} bytes) from {}",
                ctx.counters.feedback_pkts, nread, source
            ),
        );
        logger::event(format_args!(
            "{}\trec\tROHC feedback\t{}\t{}\tfrom\t{}\t{}",
            logger::timestamp_us(),
            nread,
            ctx.counters.feedback_pkts,
            ctx.config.remote_ip,
            ctx.config.feedback_port
        ));
        if let Some(codec) = ctx.rohc.as_mut() {
            if let Err(err) = codec.deliver_feedback(payload) {
                ctx.counters.rohc_failures += 1;
                logger::debug(
                    3,
                    TraceFlags::FEEDBACK,
                    format!("error delivering feedback to the compressor: {err}"),
                );
            }
        }
    } else {
        // Right port, wrong source: not feedback, forward verbatim.
        logger::debug(
            1,
            TraceFlags::FEEDBACK,
            format!(
                "NON-FEEDBACK PACKET: writing {} bytes to {}",
                nread,
                ctx.tun.name()
            ),
        );
        if let Err(err) = ctx.tun.write_packet(payload) {
            logger::error(format!("could not forward a non-feedback packet: {err}"));
        }
        logger::event(format_args!(
            "{}\tforward\tnative\t{}\t{}\tfrom\t{}\t{}",
            logger::timestamp_us(),
            nread,
            ctx.counters.net2tun,
            ctx.config.remote_ip,
            ctx.config.port
        ));
    }
    Ok(())
}

/// A native packet/frame arrived on the inner interface.
fn handle_tun(ctx: &mut Context) -> anyhow::Result<()> {
    let mut buf = [0u8; BUFSIZE];
    let nread = ctx.tun.read_packet(&mut buf)?;
    let packet = &buf[..nread];
    ctx.counters.tun2net = ctx.counters.tun2net.wrapping_add(1);
    let now = logger::timestamp_us();

    logger::debug(
        1,
        TraceFlags::NATIVE,
        format!(
            "NATIVE PACKET #{}: read packet from {}: {} bytes",
            ctx.counters.tun2net,
            ctx.tun.name(),
            nread
        ),
    );
    logger::event(format_args!(
        "{now}\trec\tnative\t{}\t{}",
        nread, ctx.counters.tun2net
    ));

    match ctx.config.flavor {
        Flavor::Blast => blast_tun_packet(ctx, packet, now),
        _ => mux_tun_packet(ctx, packet, now),
    }
}

fn mux_tun_packet(ctx: &mut Context, packet: &[u8], now: u64) -> anyhow::Result<()> {
    let (protocol, payload) = if ctx.config.rohc_mode.is_enabled() {
        match ctx.rohc.as_mut() {
            Some(codec) => match codec.compress(packet) {
                Ok(compressed) => (IPPROTO_ROHC, compressed),
                Err(err) => {
                    ctx.counters.rohc_failures += 1;
                    logger::debug(1, TraceFlags::MUX, format!("compression failed: {err}"));
                    logger::event(format_args!(
                        "{now}\tdrop\trohc\t{}\t{}",
                        packet.len(),
                        ctx.counters.tun2net
                    ));
                    return Ok(());
                }
            },
            None => (ctx.config.tunnel_mode.native_protocol(), packet.to_vec()),
        }
    } else {
        (ctx.config.tunnel_mode.native_protocol(), packet.to_vec())
    };

    match ctx
        .assembler
        .accept(protocol, &payload, now, ctx.time_last_sent)
    {
        AcceptOutcome::Stored => {
            logger::debug(
                1,
                TraceFlags::MUX,
                format!(
                    "  Packet stopped: accumulated {} packet(s), {} bytes",
                    ctx.assembler.num_stored(),
                    ctx.assembler.pending_size()
                ),
            );
        }
        AcceptOutcome::RejectedTooLarge => {
            ctx.counters.oversized_dropped += 1;
            logger::warn(format!(
                "packet of {} bytes does not fit under the MTU {}; dropped",
                payload.len(),
                ctx.selected_mtu
            ));
            logger::event(format_args!(
                "{now}\tdrop\toversized\t{}\t{}",
                payload.len(),
                ctx.counters.tun2net
            ));
        }
        AcceptOutcome::Flushed(bundles) => {
            for bundle in &bundles {
                send_bundle_logged(ctx, bundle)?;
            }
            ctx.time_last_sent = now;
        }
    }
    Ok(())
}

fn blast_tun_packet(ctx: &mut Context, packet: &[u8], now: u64) -> anyhow::Result<()> {
    // The identifier is the low 16 bits of the packet counter.
    let identifier = (ctx.counters.tun2net & 0xFFFF) as u16;
    let protocol = ctx.config.tunnel_mode.native_protocol();
    let (wire, retained) = ctx.blast.send_native(identifier, protocol, packet, now);
    let outer = ctx.transport.send_bundle(&wire)?;

    logger::debug(
        1,
        TraceFlags::BLAST,
        format!(
            " Sent blast packet to the network. ID {identifier}, length {} bytes",
            packet.len()
        ),
    );
    logger::event(format_args!(
        "{now}\tsent\tmuxed\t{outer}\t{}\tto\t{}\t{}\t1\tblast",
        ctx.counters.tun2net,
        ctx.config.remote_ip,
        remote_port_field(ctx)
    ));
    if retained {
        logger::debug(
            2,
            TraceFlags::BLAST,
            format!(
                " The packet has been stored in the confirmation-pending list. Total {} stored",
                ctx.blast.unconfirmed_len()
            ),
        );
    } else {
        logger::debug(
            2,
            TraceFlags::BLAST,
            " The packet has not been stored: no recent heartbeat from the other side",
        );
    }
    Ok(())
}

fn handle_blast_datagram(ctx: &mut Context, datagram: &[u8]) -> anyhow::Result<()> {
    let now = logger::timestamp_us();
    let (header, inbound) = match ctx.blast.on_wire(datagram, now) {
        Ok(result) => result,
        Err(err) => {
            ctx.counters.malformed_bundles += 1;
            logger::error(format!("bad blast packet: {err}"));
            return Ok(());
        }
    };

    match inbound {
        BlastInbound::Deliver { ack } => {
            let payload = &datagram[BLAST_HEADER_SIZE..];
            if ctx.config.tunnel_mode == TunnelMode::Tap && header.protocol != IPPROTO_ETHERNET {
                logger::debug(
                    2,
                    TraceFlags::BLAST,
                    format!(
                        "wrong Protocol {} in a blast frame; it should be {IPPROTO_ETHERNET}",
                        header.protocol
                    ),
                );
            } else {
                write_inner(ctx, payload);
                ctx.blast.mark_delivered(header.identifier, now);
            }
            ctx.transport.send_bundle(&ack)?;
            logger::debug(
                1,
                TraceFlags::BLAST,
                format!(" Sent blast ACK to the network. ID {}", header.identifier),
            );
        }
        BlastInbound::Suppressed { ack } => {
            ctx.counters.blast_duplicates_suppressed += 1;
            logger::debug(
                1,
                TraceFlags::BLAST,
                format!(
                    " The packet with ID {} was delivered recently; not delivering this copy",
                    header.identifier
                ),
            );
            ctx.transport.send_bundle(&ack)?;
        }
        BlastInbound::AckHandled { removed } => {
            if removed {
                logger::debug(
                    2,
                    TraceFlags::BLAST,
                    format!(
                        " Packet with ID {} removed from the confirmation-pending list. Total {} stored",
                        header.identifier,
                        ctx.blast.unconfirmed_len()
                    ),
                );
            } else {
                logger::debug(
                    2,
                    TraceFlags::BLAST,
                    format!(" Duplicate ACK for ID {}", header.identifier),
                );
            }
        }
        BlastInbound::Heartbeat => {
            logger::debug(2, TraceFlags::BLAST, " Blast heartbeat received");
        }
    }
    Ok(())
}

/// The poll timed out: run the period path.
fn handle_period(ctx: &mut Context) -> anyhow::Result<()> {
    let now = logger::timestamp_us();
    logger::debug(2, TraceFlags::POLL, "Poll timeout expired");

    match ctx.config.flavor {
        Flavor::Blast => {
            if ctx.blast.heartbeat_alive(now) {
                let resends = ctx.blast.collect_resends(now, ctx.policy.period_us);
                let resent = resends.len();
                for wire in resends {
                    ctx.transport.send_bundle(&wire)?;
                }
                if resent > 0 {
                    logger::debug(
                        1,
                        TraceFlags::BLAST,
                        format!(" Period expired: sent {resent} blast packets (copies)"),
                    );
                }
            } else {
                logger::debug(
                    2,
                    TraceFlags::BLAST,
                    " Period expired, but nothing is sent: no recent heartbeat",
                );
            }

            if ctx.blast.heartbeat_due(now) {
                let heartbeat = ctx.blast.make_heartbeat(now);
                ctx.transport.send_bundle(&heartbeat)?;
                logger::debug(1, TraceFlags::BLAST, " Sent blast heartbeat to the network");
            }
        }
        _ => {
            if let Some(bundle) = ctx.assembler.flush_period() {
                send_bundle_logged(ctx, &bundle)?;
            }
            ctx.time_last_sent = now;
        }
    }
    Ok(())
}

fn send_bundle_logged(ctx: &mut Context, bundle: &Bundle) -> anyhow::Result<()> {
    let outer = ctx.transport.send_bundle(&bundle.bytes)?;
    let trigger = match bundle.reason {
        FlushReason::PacketLimit => "packet limit reached",
        FlushReason::SizeThreshold => "size threshold reached",
        FlushReason::Timeout => "timeout expired",
        FlushReason::Period => "period expired",
        FlushReason::Overflow => "MTU reached",
    };
    logger::debug(
        1,
        TraceFlags::MUX,
        format!(
            "SENDING TRIGGERED ({trigger}). Writing {} packets to network: {outer} bytes",
            bundle.packet_count
        ),
    );
    logger::event(format_args!(
        "{}\tsent\tmuxed\t{outer}\t{}\tto\t{}\t{}\t{}\t{}",
        logger::timestamp_us(),
        ctx.counters.tun2net,
        ctx.config.remote_ip,
        remote_port_field(ctx),
        bundle.packet_count,
        bundle.reason.log_label()
    ));
    Ok(())
}

/// The port column of event-log lines; empty in network mode, which has no
/// ports.
fn remote_port_field(ctx: &Context) -> String {
    match ctx.config.mode {
        Mode::Network => String::new(),
        _ => ctx.config.port.to_string(),
    }
}
