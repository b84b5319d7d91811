//! The tun/tap virtual interface carrying native packets.
//!
//! Each read yields one whole L3 packet (tun) or L2 frame (tap); writes
//! accept the same. `IFF_NO_PI` keeps the packet-info prefix off the fd.

use crate::config::TunnelMode;
use std::ffi::CStr;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, RawFd};

const TUN_DEVICE: &str = "/dev/net/tun";

pub struct TunDevice {
    file: File,
    name: String,
}

impl TunDevice {
    /// Opens the clone device and attaches to `requested` (or lets the
    /// kernel pick a name when empty).
    pub fn open(requested: &str, mode: TunnelMode) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(TUN_DEVICE)?;

        let mut ifreq: libc::ifreq = unsafe { mem::zeroed() };
        for (index, byte) in requested.as_bytes().iter().enumerate() {
            if index >= libc::IFNAMSIZ - 1 {
                break;
            }
            ifreq.ifr_name[index] = *byte as libc::c_char;
        }
        let flags = match mode {
            TunnelMode::Tun => libc::IFF_TUN,
            TunnelMode::Tap => libc::IFF_TAP,
        } | libc::IFF_NO_PI;
        ifreq.ifr_ifru.ifru_flags = flags as libc::c_short;

        let status = unsafe { libc::ioctl(file.as_raw_fd(), libc::TUNSETIFF, &ifreq) };
        if status < 0 {
            return Err(io::Error::last_os_error());
        }

        let name = unsafe {
            CStr::from_ptr(ifreq.ifr_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        };
        Ok(Self { file, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads one native packet/frame.
    pub fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    /// Writes one native packet/frame; a short write is an error.
    pub fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        let written = self.file.write(packet)?;
        if written != packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write to the tun/tap interface",
            ));
        }
        Ok(())
    }
}

impl AsRawFd for TunDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
