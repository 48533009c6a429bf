// SPDX-License-Identifier: GPL-2.0-or-later

use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::error::{Error, Result};

const CONSOLE_SOCK: &str = "console.sock";
const QMP_SOCK: &str = "qmp.sock";

/// Supervises the QEMU child: socket wiring, launch, liveness, hard
/// shutdown.
pub struct QemuMachine {
    binary: PathBuf,
    args: Vec<String>,
    instance_dir: PathBuf,
    child: Option<Child>,
}

impl QemuMachine {
    /// `binary` is the configured override, otherwise `qemu-system-x86_64`
    /// from PATH.
    pub fn new(binary: Option<&str>, instance_dir: &Path) -> Result<QemuMachine> {
        let binary = match binary {
            Some(b) => PathBuf::from(b),
            None => which::which("qemu-system-x86_64").map_err(|_| Error::HelperMissing {
                binary: "qemu-system-x86_64".to_string(),
            })?,
        };

        Ok(QemuMachine {
            binary,
            args: Vec::new(),
            instance_dir: instance_dir.to_path_buf(),
            child: None,
        })
    }

    pub fn add_args(&mut self, args: impl IntoIterator<Item = String>) {
        self.args.extend(args);
    }

    fn console_path(&self) -> PathBuf {
        self.instance_dir.join(CONSOLE_SOCK)
    }

    fn qmp_path(&self) -> PathBuf {
        self.instance_dir.join(QMP_SOCK)
    }

    /// Connectors present on every invocation: no display, a null monitor
    /// sink, a QMP socket, and the serial console on a stream socket.
    fn base_args(&self) -> Vec<String> {
        vec![
            "-display".to_string(),
            "none".to_string(),
            "-monitor".to_string(),
            "null".to_string(),
            "-qmp".to_string(),
            format!("unix:{},server=on,wait=off", self.qmp_path().display()),
            "-chardev".to_string(),
            format!(
                "socket,id=qc-console,path={},server=on,wait=off",
                self.console_path().display()
            ),
            "-device".to_string(),
            "isa-serial,chardev=qc-console".to_string(),
        ]
    }

    /// Spawn QEMU and connect to its serial console socket.
    pub fn launch(&mut self) -> Result<UnixStream> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.base_args())
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(
            "launching {} {}",
            self.binary.display(),
            self.args.join(" ")
        );

        let child = cmd.spawn().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                Error::HelperMissing {
                    binary: self.binary.display().to_string(),
                }
            } else {
                Error::Io(err)
            }
        })?;
        self.child = Some(child);

        let console = self.connect_console()?;
        Ok(console)
    }

    fn connect_console(&mut self) -> Result<UnixStream> {
        let path = self.console_path();
        let deadline = Instant::now() + Duration::from_secs(5);

        loop {
            match UnixStream::connect(&path) {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    if let Some(status) = self.child.as_mut().and_then(|c| c.try_wait().ok()?) {
                        self.drain_io_log();
                        return Err(Error::Other(format!(
                            "qemu exited during startup with {status}"
                        )));
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::Other(format!(
                            "console socket {} not available: {err}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    pub fn pid(&self) -> Option<i32> {
        self.child.as_ref().map(|c| c.id() as i32)
    }

    /// Advisory liveness: signal 0 on the recorded pid.
    pub fn is_running(&self) -> bool {
        match self.pid() {
            Some(pid) => kill(Pid::from_raw(pid), None).is_ok(),
            None => false,
        }
    }

    /// Hard shutdown: SIGKILL and await exit. Failures surface as
    /// `AbnormalShutdown` so the session can log and keep cleaning up.
    pub fn shutdown_hard(&mut self) -> Result<()> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };

        let pid = Pid::from_raw(child.id() as i32);
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(errno) => return Err(Error::AbnormalShutdown(errno.into())),
        }

        child.wait().map_err(Error::AbnormalShutdown)?;
        Ok(())
    }

    /// Pull whatever the child wrote to its stdout/stderr into the session
    /// log. Called from cleanup; best-effort.
    pub fn drain_io_log(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };

        for stream in [
            child.stdout.take().map(|s| ("stdout", s.as_raw_fd(), Box::new(s) as Box<dyn Read>)),
            child.stderr.take().map(|s| ("stderr", s.as_raw_fd(), Box::new(s) as Box<dyn Read>)),
        ]
        .into_iter()
        .flatten()
        {
            let (label, fd, mut reader) = stream;
            set_nonblocking(fd);
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            if !buf.is_empty() {
                info!("qemu {label}: {}", String::from_utf8_lossy(&buf).trim_end());
            }
        }
    }
}

impl Drop for QemuMachine {
    fn drop(&mut self) {
        // the session normally shuts the vm down explicitly; this is the
        // abnormal-exit backstop
        if self.is_running() {
            if let Err(err) = self.shutdown_hard() {
                warn!("failed to stop qemu on drop: {err}");
            }
        }
    }
}

fn set_nonblocking(fd: i32) {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFL) {
        let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
        let _ = fcntl(fd, FcntlArg::F_SETFL(flags));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_args_wire_console_and_qmp() {
        let tmp = tempfile::tempdir().unwrap();
        let machine = QemuMachine::new(Some("/usr/bin/true"), tmp.path()).unwrap();
        let args = machine.base_args();

        let rendered = args.join(" ");
        assert!(rendered.contains("-display none"));
        assert!(rendered.contains("-monitor null"));
        assert!(rendered.contains("console.sock,server=on,wait=off"));
        assert!(rendered.contains("isa-serial,chardev=qc-console"));
        assert!(rendered.contains(&format!("unix:{}/qmp.sock", tmp.path().display())));
    }

    #[test]
    fn explicit_binary_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let machine = QemuMachine::new(Some("/opt/qemu/bin/qemu-kvm"), tmp.path()).unwrap();
        assert_eq!(machine.binary, PathBuf::from("/opt/qemu/bin/qemu-kvm"));
    }
}
