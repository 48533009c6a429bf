// SPDX-License-Identifier: GPL-2.0-or-later

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::fd::AsRawFd;

use tracing::{debug, info};

use crate::error::{Error, Result};

pub const VSOCK_PATH: &str = "/dev/vhost-vsock";

// VHOST_VSOCK_SET_GUEST_CID = _IOW(VHOST_VIRTIO, 0x60, __u64)
nix::ioctl_write_ptr!(vhost_vsock_set_guest_cid, 0xAF, 0x60, u64);

/// A reserved guest CID. The kernel keeps the CID assigned for as long as
/// the control-device handle stays open, so the handle lives here and the
/// reservation ends when the guard drops.
#[derive(Debug)]
pub struct CidGuard {
    _device: File,
    cid: u32,
}

impl CidGuard {
    pub fn cid(&self) -> u32 {
        self.cid
    }
}

/// Reserve the first free guest CID at or above `start`. A busy address
/// advances to the next candidate; a missing or unopenable control device
/// means no CID can be had at all.
pub fn allocate_guest_cid(start: u32) -> Result<CidGuard> {
    let device = match OpenOptions::new().read(true).write(true).open(VSOCK_PATH) {
        Ok(f) => f,
        Err(err) => {
            info!(
                "could not open {VSOCK_PATH} ({err}), make sure vhost_vsock module is loaded \
                 by running `modprobe vhost_vsock` as root"
            );
            return Err(Error::NoCidAvailable);
        }
    };

    let mut candidate = start;
    while candidate < u32::MAX {
        let cid = u64::from(candidate);
        // SAFETY: valid open fd, cid outlives the call
        let res = unsafe { vhost_vsock_set_guest_cid(device.as_raw_fd(), &cid) };
        match res {
            Ok(_) => {
                debug!("reserved guest cid {candidate}");
                return Ok(CidGuard {
                    _device: device,
                    cid: candidate,
                });
            }
            Err(errno) => {
                let err: std::io::Error = errno.into();
                if err.kind() == ErrorKind::AddrInUse {
                    candidate += 1;
                    continue;
                }
                return Err(Error::Io(err));
            }
        }
    }

    Err(Error::NoCidAvailable)
}
