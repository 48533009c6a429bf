// SPDX-License-Identifier: GPL-2.0-or-later

use std::io::Read;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

const VIRTIOFSD_SEARCH_PATH: &str = "/usr/lib:/usr/libexec";
const SOCKET_WAIT_BUDGET: Duration = Duration::from_secs(30);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// A parsed `src:dst[:ro]` volume declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub src: String,
    pub dst: String,
    pub read_only: bool,
}

/// Exactly two or three colon-separated segments; `ro` is the only
/// recognized option; empty `src` or `dst` rejects the spec.
pub fn parse_volume_spec(spec: &str) -> Option<VolumeSpec> {
    let parts: Vec<&str> = spec.split(':').map(str::trim).collect();

    let (src, dst, option) = match parts.as_slice() {
        [src, dst] => (*src, *dst, None),
        [src, dst, option] => (*src, *dst, Some(*option)),
        _ => return None,
    };

    if src.is_empty() || dst.is_empty() {
        return None;
    }

    let read_only = match option {
        None => false,
        Some(o) if o.eq_ignore_ascii_case("ro") => true,
        Some(_) => return None,
    };

    Some(VolumeSpec {
        src: src.to_string(),
        dst: dst.to_string(),
        read_only,
    })
}

/// Guest-visible tag: sanitized basename of `dst` (or `vol<index>`), with
/// the volume index appended.
pub fn volume_tag(dst: &str, index: usize) -> String {
    let base = Path::new(dst)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("vol{index}"));

    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    format!("{sanitized}-{index}")
}

/// One accepted volume, after its daemon came up.
#[derive(Debug)]
pub struct AcceptedVolume {
    pub index: usize,
    pub tag: String,
    pub socket_path: PathBuf,
    pub fstab_entry: String,
}

/// Owns the auxiliary filesystem daemons for the session. Cleanup is
/// idempotent and runs on every exit path.
#[derive(Default)]
pub struct VirtiofsSupervisor {
    children: Vec<Child>,
}

impl VirtiofsSupervisor {
    pub fn new() -> VirtiofsSupervisor {
        VirtiofsSupervisor::default()
    }

    /// Launch one daemon per declared volume. Rejected specs and daemons
    /// that never produce their socket are skipped with a warning.
    pub fn launch_volumes(
        &mut self,
        instance_dir: &Path,
        volumes: &[String],
    ) -> Vec<AcceptedVolume> {
        let mut accepted = Vec::new();

        for (index, raw) in volumes.iter().enumerate() {
            let Some(spec) = parse_volume_spec(raw) else {
                warn!("ignoring malformed volume spec '{raw}'");
                continue;
            };

            let tag = volume_tag(&spec.dst, index);
            let socket_path = instance_dir.join(format!("virtiofs-{tag}.sock"));

            let Some(mut child) = start_virtiofsd(&spec, &socket_path) else {
                continue;
            };

            if !wait_for_socket(&mut child, &socket_path) {
                warn!(
                    "virtiofsd socket not ready, skipping mount {} -> {}",
                    spec.src, spec.dst
                );
                terminate_child(&mut child);
                continue;
            }

            let ro_suffix = if spec.read_only { ",ro" } else { "" };
            accepted.push(AcceptedVolume {
                index,
                tag: tag.clone(),
                socket_path,
                fstab_entry: format!("{tag} {} virtiofs defaults{ro_suffix} 0 0", spec.dst),
            });
            self.children.push(child);
        }

        accepted
    }

    /// Terminate, wait briefly, kill, close streams. Per-child errors are
    /// swallowed but logged.
    pub fn cleanup(&mut self) {
        for mut child in self.children.drain(..) {
            terminate_child(&mut child);
        }
    }
}

impl Drop for VirtiofsSupervisor {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn start_virtiofsd(spec: &VolumeSpec, socket_path: &Path) -> Option<Child> {
    let is_root = nix::unistd::getuid().is_root();

    let unshare_bin = which::which("unshare").ok();
    if !is_root && unshare_bin.is_none() {
        warn!(
            "unshare command not found; volume '{}' will not be available",
            spec.src
        );
        return None;
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    let Ok(virtiofsd_bin) = which::which_in("virtiofsd", Some(VIRTIOFSD_SEARCH_PATH), &cwd)
    else {
        warn!(
            "virtiofsd command not found; volume '{}' will not be available",
            spec.src
        );
        return None;
    };

    let mut cmd = match (&unshare_bin, is_root) {
        // unprivileged: run under a user namespace with identity mapping
        (Some(unshare), false) => {
            let mut cmd = Command::new(unshare);
            cmd.args(["-r", "--map-auto", "--"]).arg(&virtiofsd_bin);
            cmd
        }
        _ => Command::new(&virtiofsd_bin),
    };

    cmd.arg("--shared-dir")
        .arg(&spec.src)
        .arg("--socket-path")
        .arg(socket_path)
        .args(["--cache", "never"])
        .arg("--allow-direct-io")
        .args(["--thread-pool-size", "8"])
        .args(["--sandbox", "chroot"]);

    if virtiofsd_advertises_mmap(&virtiofsd_bin) {
        cmd.arg("--allow-mmap");
    }

    if spec.read_only {
        cmd.arg("--readonly");
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    info!("running virtiofsd for {} -> {}", spec.src, spec.dst);
    match cmd.spawn() {
        Ok(child) => Some(child),
        Err(err) => {
            warn!("failed to start virtiofsd for {}: {err}", spec.src);
            None
        }
    }
}

fn virtiofsd_advertises_mmap(virtiofsd_bin: &Path) -> bool {
    Command::new(virtiofsd_bin)
        .arg("-h")
        .output()
        .map(|out| {
            let help = [out.stdout, out.stderr].concat();
            String::from_utf8_lossy(&help).contains("--allow-mmap")
        })
        .unwrap_or(false)
}

/// Poll for the daemon socket with a 30-second budget, draining the child's
/// output into the session log while waiting.
fn wait_for_socket(child: &mut Child, path: &Path) -> bool {
    let deadline = Instant::now() + SOCKET_WAIT_BUDGET;

    drain_child_output(child);
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        std::thread::sleep(SOCKET_POLL_INTERVAL);
        drain_child_output(child);
    }

    path.exists()
}

fn drain_child_output(child: &mut Child) {
    fn drain(label: &str, fd: i32, reader: &mut impl Read) {
        use nix::fcntl::{fcntl, FcntlArg, OFlag};
        if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFL) {
            let _ = fcntl(
                fd,
                FcntlArg::F_SETFL(OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK),
            );
        }

        let mut buf = [0u8; 1024];
        if let Ok(n) = reader.read(&mut buf) {
            if n > 0 {
                debug!(
                    "virtiofsd {label}: {}",
                    String::from_utf8_lossy(&buf[..n]).trim_end()
                );
            }
        }
    }

    if let Some(stdout) = child.stdout.as_mut() {
        let fd = stdout.as_raw_fd();
        drain("stdout", fd, stdout);
    }
    if let Some(stderr) = child.stderr.as_mut() {
        let fd = stderr.as_raw_fd();
        drain("stderr", fd, stderr);
    }
}

fn terminate_child(child: &mut Child) {
    let pid = Pid::from_raw(child.id() as i32);

    match child.try_wait() {
        Ok(Some(_)) => {}
        _ => {
            if let Err(err) = kill(pid, Signal::SIGTERM) {
                debug!("terminate virtiofsd failed: {err}");
            }

            let deadline = Instant::now() + TERMINATE_GRACE;
            let mut exited = false;
            while Instant::now() < deadline {
                match child.try_wait() {
                    Ok(Some(_)) => {
                        exited = true;
                        break;
                    }
                    Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                    Err(err) => {
                        debug!("wait virtiofsd failed: {err}");
                        break;
                    }
                }
            }

            if !exited {
                if let Err(err) = child.kill() {
                    debug!("kill virtiofsd failed: {err}");
                }
                let _ = child.wait();
            }
        }
    }

    drop(child.stdin.take());
    drop(child.stdout.take());
    drop(child.stderr.take());
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("/host/path:/mnt/data", Some(("/host/path", "/mnt/data", false)))]
    #[test_case("/host/path:/mnt/ro:ro", Some(("/host/path", "/mnt/ro", true)); "lowercase_ro")]
    #[test_case("/host/path:/mnt/ro:RO", Some(("/host/path", "/mnt/ro", true)); "uppercase_ro")]
    #[test_case("/just-one", None)]
    #[test_case(":/missing-src", None)]
    #[test_case("/missing-dst:", None)]
    #[test_case("/a:/b:rw", None)]
    #[test_case("/a:/b:ro:extra", None)]
    fn volume_spec_grammar(spec: &str, expected: Option<(&str, &str, bool)>) {
        let parsed = parse_volume_spec(spec);
        match expected {
            None => assert!(parsed.is_none()),
            Some((src, dst, ro)) => {
                let v = parsed.unwrap();
                assert_eq!(v.src, src);
                assert_eq!(v.dst, dst);
                assert_eq!(v.read_only, ro);
            }
        }
    }

    #[test_case("/mnt/data", 0, "data-0")]
    #[test_case("/mnt/my.dir", 2, "my_dir-2")]
    #[test_case("/", 3, "vol3-3")]
    #[test_case("/mnt/with space", 1, "with_space-1")]
    fn tags(dst: &str, index: usize, expected: &str) {
        assert_eq!(volume_tag(dst, index), expected);
    }

    #[test]
    fn fstab_entry_shape() {
        let entry = format!(
            "{} {} virtiofs defaults{} 0 0",
            volume_tag("/mnt/data", 0),
            "/mnt/data",
            ",ro"
        );
        assert_eq!(entry, "data-0 /mnt/data virtiofs defaults,ro 0 0");
    }

    #[test]
    fn cleanup_is_idempotent() {
        let mut supervisor = VirtiofsSupervisor::new();
        supervisor.cleanup();
        supervisor.cleanup();
        assert!(supervisor.children.is_empty());
    }
}
