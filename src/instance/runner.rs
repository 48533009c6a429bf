// SPDX-License-Identifier: GPL-2.0-or-later

//! The session engine: resolves identity, locks the instance directory,
//! materializes storage, synthesizes the QEMU invocation, launches the VM
//! and drives the console, then tears everything down on every exit path.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use indexmap::IndexMap;
use tracing::{error, info, warn};

use crate::config::QemuConfig;
use crate::error::{Error, Result};
use crate::http::HttpServer;
use crate::image::{load_image_by_id, load_image_by_name, DiskSpec, ImageManifest};
use crate::instance::lock::InstanceLock;
use crate::instance::names::check_and_get_name;
use crate::instance::sshkey::prepare_ssh_key;
use crate::instance::virtiofs::{AcceptedVolume, VirtiofsSupervisor};
use crate::instance::{new_random_vmid, resolve_instance};
use crate::logging::SessionLog;
use crate::qemu::QemuMachine;
use crate::store::LocalStore;
use crate::terminal::Terminal;
use crate::util::{expand_placeholders, safe_read, terminal_size, to_valid_hostname};
use crate::vsock::{allocate_guest_cid, CidGuard};

const GATEWAY_IP: &str = "10.0.2.2";
const NETDEV_ID: &str = "user.qemu-compose";

pub struct Runner {
    config: QemuConfig,
    store: LocalStore,
    cwd: PathBuf,
    interrupt: Arc<AtomicBool>,

    vm_name: Option<String>,
    vmid: Option<String>,
    cid: Option<CidGuard>,
    lock: Option<InstanceLock>,
    image_manifest: Option<ImageManifest>,
    storage_overlays: Vec<(PathBuf, DiskSpec)>,
    virtiofs: VirtiofsSupervisor,
    env: BTreeMap<String, String>,
    machine: Option<QemuMachine>,
    terminal: Option<Terminal>,
}

impl Runner {
    pub fn new(
        config: QemuConfig,
        store: LocalStore,
        cwd: PathBuf,
        interrupt: Arc<AtomicBool>,
    ) -> Runner {
        Runner {
            config,
            store,
            cwd,
            interrupt,
            vm_name: None,
            vmid: None,
            cid: None,
            lock: None,
            image_manifest: None,
            storage_overlays: Vec::new(),
            virtiofs: VirtiofsSupervisor::new(),
            env: BTreeMap::new(),
            machine: None,
            terminal: None,
        }
    }

    fn vmid(&self) -> Result<&str> {
        self.vmid
            .as_deref()
            .ok_or_else(|| Error::Other("vmid is not set".to_string()))
    }

    fn instance_dir(&self) -> Result<PathBuf> {
        let vmid = self.vmid()?;
        self.store.instance_dir(vmid).map_err(Error::Io)
    }

    /// Top-to-bottom session flow. Cleanup is the caller's duty via
    /// `shutdown_and_cleanup`, which must run regardless of the outcome.
    pub fn run_session(&mut self) -> Result<()> {
        self.check_and_lock()?;
        self.prepare_env()?;
        self.prepare_storage()?;
        self.execute_script("before_script")?;

        let args = self.synthesize_invocation()?;

        let result = self.launch_and_interact(args);
        match result {
            Err(Error::Interrupted) => {
                warn!("Keyboard interrupt, shutting down vm...");
                Ok(())
            }
            other => other,
        }
    }

    fn launch_and_interact(&mut self, args: Vec<String>) -> Result<()> {
        self.start(args)?;
        self.interact()?;
        self.execute_script("after_script")
    }

    /// Resolve the image, allocate identity (name, vmid, guest CID), create
    /// and lock the instance directory, attach the session log.
    pub fn check_and_lock(&mut self) -> Result<()> {
        let image_root = self.store.image_root().map_err(Error::Io)?;
        let instance_root = self.store.instance_root().map_err(Error::Io)?;

        if let Some(token) = self.config.image.clone() {
            let manifest = load_image_by_id(&image_root, &token)
                .or_else(|| load_image_by_name(&image_root, &token))
                .ok_or(Error::ImageNotFound { token })?;
            self.image_manifest = Some(manifest);
        }

        match self.config.instance.clone() {
            None => {
                self.vm_name = Some(check_and_get_name(
                    &instance_root,
                    self.config.name.as_deref(),
                )?);
                self.vmid = Some(new_random_vmid(&instance_root));
            }
            Some(token) => {
                let vmid = resolve_instance(&instance_root, &token)?;
                self.vm_name = safe_read(instance_root.join(&vmid).join("name"));
                self.vmid = Some(vmid);
            }
        }

        self.cid = Some(allocate_guest_cid(1000)?);

        let vmid = self.vmid()?.to_string();
        let instance_dir = self
            .store
            .instance_dir(&vmid)
            .map_err(|err| Error::DirectoryCreate {
                dir: instance_root.join(&vmid),
                source: err,
            })?;

        if let Err(err) = SessionLog::global().attach(instance_dir.join("qemu-compose.log")) {
            warn!("failed to open session log: {err}");
        }

        // lock early so a prune cannot remove contents before qemu starts
        self.lock = Some(InstanceLock::acquire(&instance_dir)?);

        if self.config.instance.is_none() {
            self.config.save_to(&instance_dir);
        }

        Ok(())
    }

    /// Populate the runtime environment, change into the working directory
    /// and start the embedded HTTP server when configured.
    pub fn prepare_env(&mut self) -> Result<()> {
        let (rows, cols) = terminal_size();
        let instance_dir = self.instance_dir()?;
        let image_root = self.store.image_root().map_err(Error::Io)?;
        let instance_root = self.store.instance_root().map_err(Error::Io)?;

        let mut env = BTreeMap::new();
        env.insert("CWD".to_string(), self.cwd.display().to_string());
        env.insert("GATEWAY_IP".to_string(), GATEWAY_IP.to_string());
        env.insert("TERM_ROWS".to_string(), rows.to_string());
        env.insert("TERM_COLS".to_string(), cols.to_string());
        env.insert("ID".to_string(), self.vmid()?.to_string());
        env.insert(
            "STORAGE_PATH".to_string(),
            self.store.data_dir().display().to_string(),
        );
        env.insert("IMAGE_ROOT".to_string(), image_root.display().to_string());
        env.insert(
            "INSTANCE_ROOT".to_string(),
            instance_root.display().to_string(),
        );
        env.insert(
            "INSTANCE_DIR".to_string(),
            instance_dir.display().to_string(),
        );

        if let Some(image) = &self.config.image {
            env.insert("IMAGE_TAG".to_string(), image.clone());
        }
        if let Some(manifest) = &self.image_manifest {
            env.insert(
                "IMAGE_DIR".to_string(),
                image_root.join(&manifest.id).display().to_string(),
            );
            env.insert("IMAGE_ID".to_string(), manifest.id.clone());
        }

        for (key, value) in &self.config.env {
            env.insert(key.clone(), value.clone());
        }

        info!("change directory to {}", self.cwd.display());
        std::env::set_current_dir(&self.cwd)?;

        if let Some(http) = self.config.http_serve.clone() {
            let expand = |value: Option<&str>, default: &str| -> String {
                match value {
                    Some(v) if !v.is_empty() => expand_placeholders(v, &env),
                    _ => default.to_string(),
                }
            };

            let listen = expand(http.listen.as_deref(), "0.0.0.0");
            let port: u16 = expand(http.port.as_deref(), "8888")
                .parse()
                .map_err(|_| Error::Other("http_serve: invalid port".to_string()))?;
            let root = PathBuf::from(expand(http.root.as_deref(), &env["CWD"]));
            let access_ip = expand(http.access_ip.as_deref(), GATEWAY_IP);

            HttpServer {
                listen,
                port,
                root,
            }
            .start()?;

            env.insert("HTTP_PORT".to_string(), port.to_string());
            env.insert("HTTP_HOST".to_string(), access_ip);
        }

        self.env = env;
        Ok(())
    }

    /// Materialize copy-on-write overlays for a fresh instance; rediscover
    /// them when restarting an existing one.
    pub fn prepare_storage(&mut self) -> Result<()> {
        if self.config.instance.is_some() {
            self.storage_overlays = self.discover_existing_overlays()?;
            return Ok(());
        }

        let Some(manifest) = self.image_manifest.clone() else {
            return Ok(());
        };

        let image_dir = self
            .store
            .image_dir(&manifest.id)
            .map_err(Error::Io)?;
        let instance_dir = self.instance_dir()?;

        self.storage_overlays.clear();
        for spec in &manifest.disks {
            let base = image_dir.join(&spec.filename);
            let overlay = instance_dir.join(&spec.filename);
            create_overlay(&base, &spec.format, &overlay)?;
            self.storage_overlays.push((overlay, spec.clone()));
        }

        Ok(())
    }

    fn discover_existing_overlays(&self) -> Result<Vec<(PathBuf, DiskSpec)>> {
        let instance_dir = self.instance_dir()?;

        let mut names: Vec<String> = match fs::read_dir(&instance_dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| e.path().is_file())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|n| n.ends_with(".qcow2"))
                .collect(),
            Err(_) => return Ok(Vec::new()),
        };
        names.sort();

        Ok(names
            .into_iter()
            .map(|filename| {
                let path = instance_dir.join(&filename);
                let spec = DiskSpec {
                    filename,
                    format: "qcow2".to_string(),
                    opts: "if=virtio".to_string(),
                };
                (path, spec)
            })
            .collect())
    }

    /// Run `before_script` or `after_script` host-side, one `sh -c` per
    /// line, placeholder-expanded. A failing line aborts the session.
    pub fn execute_script(&self, which: &'static str) -> Result<()> {
        let lines = match which {
            "before_script" => &self.config.before_script,
            "after_script" => &self.config.after_script,
            _ => return Ok(()),
        };

        for line in lines {
            let command = expand_placeholders(line, &self.env);
            let command = command.trim();
            if command.is_empty() {
                continue;
            }

            info!("{which}: {command}");
            let status = Command::new("sh").arg("-c").arg(command).status()?;
            if !status.success() {
                return Err(Error::ScriptFailed {
                    script: which,
                    line: command.to_string(),
                    code: status.code().unwrap_or(1),
                });
            }
        }

        Ok(())
    }

    /// Launch auxiliary daemons, generate the SSH identity, and assemble
    /// the final argument vector.
    fn synthesize_invocation(&mut self) -> Result<Vec<String>> {
        let instance_dir = self.instance_dir()?;
        let vmid = self.vmid()?.to_string();

        let pub_bytes = prepare_ssh_key(&instance_dir, &vmid)?;
        let public_key_b64 = BASE64.encode(&pub_bytes);

        if self.storage_overlays.is_empty() && self.config.instance.is_some() {
            self.storage_overlays = self.discover_existing_overlays()?;
        }

        let volumes = self
            .virtiofs
            .launch_volumes(&instance_dir, &self.config.volumes);

        let manifest_args: Vec<String> = self
            .image_manifest
            .as_ref()
            .map(|m| m.qemu_args.clone())
            .unwrap_or_default();

        let input = SynthesisInput {
            vm_name: self.vm_name.as_deref(),
            cid: self.cid.as_ref().map(CidGuard::cid),
            network: self.config.network.as_deref(),
            ports: &self.config.ports,
            manifest_args: &manifest_args,
            config_args: &self.config.qemu_args,
            public_key_b64: &public_key_b64,
            overlays: &self.storage_overlays,
            volumes: &volumes,
            env: &self.env,
            smp: num_cpus::get(),
        };

        Ok(synthesize_args(&input))
    }

    /// Launch the VMM, wire the terminal bridge, persist runtime metadata.
    fn start(&mut self, args: Vec<String>) -> Result<()> {
        let instance_dir = self.instance_dir()?;

        let mut machine = QemuMachine::new(self.config.binary.as_deref(), &instance_dir)?;
        machine.add_args(args);
        let console = machine.launch()?;

        let terminal = Terminal::new(
            console,
            SessionLog::global().clone(),
            self.interrupt.clone(),
        )?;

        self.persist_metadata(&instance_dir, machine.pid());

        self.machine = Some(machine);
        self.terminal = Some(terminal);
        Ok(())
    }

    fn persist_metadata(&self, instance_dir: &Path, pid: Option<i32>) {
        let write = |name: &str, content: String| -> std::io::Result<()> {
            let mut f = fs::File::create(instance_dir.join(name))?;
            f.write_all(content.as_bytes())
        };

        let result = (|| -> std::io::Result<()> {
            write(
                "qemu.pid",
                pid.map(|p| p.to_string()).unwrap_or_default(),
            )?;
            write(
                "cid",
                self.cid
                    .as_ref()
                    .map(|c| c.cid().to_string())
                    .unwrap_or_default(),
            )?;
            write("name", self.vm_name.clone().unwrap_or_default())?;
            write("instance-id", self.vmid.clone().unwrap_or_default())?;
            if let Some(image) = self
                .config
                .image
                .clone()
                .or_else(|| self.image_manifest.as_ref().map(|m| m.id.clone()))
            {
                write("image", image)?;
            }
            Ok(())
        })();

        if let Err(err) = result {
            warn!("failed to write instance metadata: {err}");
        }
    }

    /// Drive the console: batch interpretation when boot commands exist,
    /// interactive raw pass-through otherwise.
    fn interact(&mut self) -> Result<()> {
        let terminal = self
            .terminal
            .as_ref()
            .ok_or_else(|| Error::Other("terminal not started".to_string()))?;

        if self.config.boot_commands.is_empty() {
            terminal.interact(true)
        } else {
            terminal.run_batch(&self.config.boot_commands, &self.env)
        }
    }

    pub fn is_running(&self) -> bool {
        self.machine.as_ref().map(QemuMachine::is_running).unwrap_or(false)
    }

    /// Idempotent teardown for every exit path: stop the VMM, reap
    /// auxiliary daemons, release the lock and the CID reservation.
    pub fn shutdown_and_cleanup(&mut self) {
        self.terminal = None;

        if let Some(machine) = self.machine.as_mut() {
            if machine.is_running() {
                if let Err(err) = machine.shutdown_hard() {
                    error!("abnormal shutdown exception: {err}");
                }
            }
            machine.drain_io_log();
        }
        self.machine = None;

        self.virtiofs.cleanup();

        self.lock = None;
        self.cid = None;
    }
}

pub fn create_overlay(base: &Path, base_format: &str, overlay: &Path) -> Result<()> {
    let qemu_img = which::which("qemu-img").map_err(|_| Error::HelperMissing {
        binary: "qemu-img".to_string(),
    })?;

    let output = Command::new(qemu_img)
        .arg("create")
        .arg("-b")
        .arg(base)
        .arg("-F")
        .arg(base_format)
        .arg("-f")
        .arg("qcow2")
        .arg(overlay)
        .output()?;

    if !output.status.success() {
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(&output.stderr);
        let _ = stderr.flush();
        return Err(Error::OverlayCreateFailed {
            filename: overlay
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string(),
            code: output.status.code().unwrap_or(1),
        });
    }

    Ok(())
}

/// Everything the argument synthesizer needs, decoupled from the live
/// session so the assembly stays a pure function.
pub struct SynthesisInput<'a> {
    pub vm_name: Option<&'a str>,
    pub cid: Option<u32>,
    pub network: Option<&'a str>,
    pub ports: &'a [String],
    pub manifest_args: &'a [String],
    pub config_args: &'a [IndexMap<String, String>],
    pub public_key_b64: &'a str,
    pub overlays: &'a [(PathBuf, DiskSpec)],
    pub volumes: &'a [AcceptedVolume],
    pub env: &'a BTreeMap<String, String>,
    pub smp: usize,
}

/// Assemble the final argument vector in a fixed order: name, safe
/// defaults, hostname credential, user network, vsock, SSH credential,
/// drives, shared filesystems, shared memory, fstab credential, then image
/// and config args.
pub fn synthesize_args(input: &SynthesisInput) -> Vec<String> {
    let mut mem_size = "1G".to_string();

    let mut defaults: Vec<(&str, String)> = vec![
        ("cpu", "max".to_string()),
        ("machine", "type=q35,hpet=off".to_string()),
        ("accel", "kvm".to_string()),
        ("m", mem_size.clone()),
        ("smp", input.smp.to_string()),
    ];

    // image-provided args drop our defaults
    for (i, arg) in input.manifest_args.iter().enumerate() {
        let Some(key) = arg.strip_prefix('-') else {
            continue;
        };
        if let Some(pos) = defaults.iter().position(|(k, _)| *k == key) {
            defaults.remove(pos);
            if key == "m" {
                if let Some(value) = input.manifest_args.get(i + 1) {
                    mem_size = value.clone();
                }
            }
        }
    }

    // user-provided args override what is left of the defaults
    for block in input.config_args {
        for (key, raw) in block {
            let value = expand_placeholders(raw, input.env);
            if value.is_empty() {
                continue;
            }
            if let Some(pos) = defaults.iter().position(|(k, _)| *k == key.as_str()) {
                defaults[pos].1 = value.clone();
                if key == "m" {
                    mem_size = value;
                }
            }
        }
    }

    let mut args: Vec<String> = Vec::new();

    if let Some(name) = input.vm_name {
        args.push("-name".to_string());
        args.push(name.to_string());
    }

    for (key, value) in &defaults {
        args.push(format!("-{key}"));
        args.push(value.clone());
    }

    let hostname = input.vm_name.map(to_valid_hostname);

    if let Some(hostname) = &hostname {
        // https://systemd.io/CREDENTIALS/
        args.push("-smbios".to_string());
        args.push(format!(
            "type=11,value=io.systemd.credential:system.hostname={hostname}"
        ));
    }

    let network = input.network.map(str::to_lowercase);
    if network.as_deref().map(|n| n == "user").unwrap_or(true) {
        let hostname_opt = hostname
            .as_deref()
            .map(|h| format!(",hostname={h}"))
            .unwrap_or_default();
        args.push("-netdev".to_string());
        args.push(format!(
            "user,id={NETDEV_ID}{hostname_opt}{}",
            hostfwd_segments(input.ports)
        ));
        args.push("-device".to_string());
        args.push(format!("virtio-net,netdev={NETDEV_ID}"));
    }

    if let Some(cid) = input.cid {
        args.push("-device".to_string());
        args.push(format!(
            "vhost-vsock-pci,id=vhost-vsock-pci0,guest-cid={cid}"
        ));
    }

    args.push("-smbios".to_string());
    args.push(format!(
        "type=11,value=io.systemd.credential.binary:ssh.authorized_keys.root={}",
        input.public_key_b64
    ));

    for (overlay, spec) in input.overlays {
        args.push("-drive".to_string());
        args.push(drive_param(overlay, spec));
    }

    for volume in input.volumes {
        args.push("-chardev".to_string());
        args.push(format!(
            "socket,id=qcfs-char{},path={}",
            volume.index,
            volume.socket_path.display()
        ));
        args.push("-device".to_string());
        args.push(format!(
            "vhost-user-fs-pci,chardev=qcfs-char{},tag={}",
            volume.index, volume.tag
        ));
    }

    if !input.volumes.is_empty() {
        // virtiofs DMA needs the guest memory on a shared backing
        args.push("-object".to_string());
        args.push(format!(
            "memory-backend-file,id=qc-mem,size={mem_size},mem-path=/dev/shm,share=on"
        ));
        args.push("-numa".to_string());
        args.push("node,memdev=qc-mem".to_string());

        let fstab: Vec<&str> = input
            .volumes
            .iter()
            .map(|v| v.fstab_entry.as_str())
            .collect();
        args.push("-smbios".to_string());
        args.push(format!(
            "type=11,value=io.systemd.credential.binary:fstab.extra={}",
            BASE64.encode(fstab.join("\n"))
        ));
    }

    for arg in input.manifest_args {
        args.push(expand_placeholders(arg, input.env));
    }

    for block in input.config_args {
        for (key, raw) in block {
            if defaults.iter().any(|(k, _)| *k == key.as_str()) {
                continue;
            }
            let value = expand_placeholders(raw, input.env);
            args.push(format!("-{key}"));
            if !value.is_empty() {
                args.push(value);
            }
        }
    }

    args
}

fn drive_param(overlay: &Path, spec: &DiskSpec) -> String {
    let mut opts = vec![format!("file={}", overlay.display())];
    if !spec.format.is_empty() {
        opts.push(format!("format={}", spec.format));
    }
    if !spec.opts.is_empty() {
        opts.push(spec.opts.clone());
    }
    opts.join(",")
}

/// `host_ip:host_port:vm_port[/proto]` or `host_port:vm_port[/proto]`.
/// Unknown protocols fall back to tcp; malformed specs yield `None`.
fn parse_port_spec(spec: &str) -> Option<(String, String, String, String)> {
    let (body, proto) = match spec.split_once('/') {
        Some((body, suffix)) => {
            let p = suffix.trim().to_lowercase();
            let p = if p == "tcp" || p == "udp" {
                p
            } else {
                "tcp".to_string()
            };
            (body, p)
        }
        None => (spec, "tcp".to_string()),
    };

    let parts: Vec<&str> = body.split(':').map(str::trim).collect();
    match parts.as_slice() {
        [host_ip, host_port, vm_port] => Some((
            proto,
            (*host_ip).to_string(),
            (*host_port).to_string(),
            (*vm_port).to_string(),
        )),
        [host_port, vm_port] => Some((
            proto,
            String::new(),
            (*host_port).to_string(),
            (*vm_port).to_string(),
        )),
        _ => None,
    }
}

fn hostfwd_segments(ports: &[String]) -> String {
    ports
        .iter()
        .filter_map(|p| parse_port_spec(p))
        .map(|(proto, host_ip, host_port, vm_port)| {
            format!(",hostfwd={proto}:{host_ip}:{host_port}-:{vm_port}")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("127.0.0.1:2222:22/tcp", ",hostfwd=tcp:127.0.0.1:2222-:22")]
    #[test_case("8080:80", ",hostfwd=tcp::8080-:80")]
    #[test_case("5353:53/udp", ",hostfwd=udp::5353-:53")]
    #[test_case("9999:99/xyz", ",hostfwd=tcp::9999-:99")]
    fn port_fragments(spec: &str, expected: &str) {
        assert_eq!(hostfwd_segments(&[spec.to_string()]), expected);
    }

    #[test]
    fn bad_port_spec_is_skipped() {
        assert_eq!(hostfwd_segments(&["bad".to_string()]), "");
        assert_eq!(hostfwd_segments(&["a:b:c:d".to_string()]), "");
    }

    fn base_input<'a>(env: &'a BTreeMap<String, String>) -> SynthesisInput<'a> {
        SynthesisInput {
            vm_name: None,
            cid: None,
            network: None,
            ports: &[],
            manifest_args: &[],
            config_args: &[],
            public_key_b64: "UFVCS0VZ",
            overlays: &[],
            volumes: &[],
            env,
            smp: 4,
        }
    }

    fn value_of<'a>(args: &'a [String], key: &str) -> Vec<&'a str> {
        args.iter()
            .enumerate()
            .filter(|(_, a)| a.as_str() == key)
            .map(|(i, _)| args[i + 1].as_str())
            .collect()
    }

    #[test]
    fn defaults_in_stable_order() {
        let env = BTreeMap::new();
        let args = synthesize_args(&base_input(&env));

        let keys: Vec<&str> = args
            .iter()
            .filter(|a| ["-cpu", "-machine", "-accel", "-m", "-smp"].contains(&a.as_str()))
            .map(String::as_str)
            .collect();
        assert_eq!(keys, ["-cpu", "-machine", "-accel", "-m", "-smp"]);
        assert_eq!(value_of(&args, "-m"), ["1G"]);
        assert_eq!(value_of(&args, "-smp"), ["4"]);
    }

    #[test]
    fn user_override_replaces_default_exactly_once() {
        let env = BTreeMap::new();
        let mut block = IndexMap::new();
        block.insert("m".to_string(), "2G".to_string());
        let config_args = vec![block];

        let mut input = base_input(&env);
        input.config_args = &config_args;
        let args = synthesize_args(&input);

        assert_eq!(value_of(&args, "-m"), ["2G"]);
    }

    #[test]
    fn image_override_drops_default() {
        let env = BTreeMap::new();
        let manifest_args = vec!["-m".to_string(), "4G".to_string()];

        let mut input = base_input(&env);
        input.manifest_args = &manifest_args;
        let args = synthesize_args(&input);

        // the default is gone; the image's own -m is appended instead
        assert_eq!(value_of(&args, "-m"), ["4G"]);
    }

    #[test]
    fn user_args_outside_defaults_are_appended() {
        let env = BTreeMap::new();
        let mut block = IndexMap::new();
        block.insert("cdrom".to_string(), "/iso/boot.iso".to_string());
        let config_args = vec![block];

        let mut input = base_input(&env);
        input.config_args = &config_args;
        let args = synthesize_args(&input);

        assert_eq!(value_of(&args, "-cdrom"), ["/iso/boot.iso"]);
    }

    #[test]
    fn overlays_follow_manifest_order() {
        let env = BTreeMap::new();
        let overlays = vec![
            (
                PathBuf::from("/i/disk-b.qcow2"),
                DiskSpec {
                    filename: "disk-b.qcow2".to_string(),
                    format: "qcow2".to_string(),
                    opts: "if=virtio".to_string(),
                },
            ),
            (
                PathBuf::from("/i/disk-a.qcow2"),
                DiskSpec {
                    filename: "disk-a.qcow2".to_string(),
                    format: "qcow2".to_string(),
                    opts: String::new(),
                },
            ),
        ];

        let mut input = base_input(&env);
        input.overlays = &overlays;
        let args = synthesize_args(&input);

        let drives = value_of(&args, "-drive");
        assert_eq!(
            drives,
            [
                "file=/i/disk-b.qcow2,format=qcow2,if=virtio",
                "file=/i/disk-a.qcow2,format=qcow2"
            ]
        );
    }

    #[test]
    fn shared_memory_present_iff_volumes_accepted() {
        let env = BTreeMap::new();

        let args = synthesize_args(&base_input(&env));
        assert!(!args.iter().any(|a| a.starts_with("memory-backend-file")));
        assert!(!args.contains(&"-numa".to_string()));

        let volumes = vec![AcceptedVolume {
            index: 0,
            tag: "data-0".to_string(),
            socket_path: PathBuf::from("/i/virtiofs-data-0.sock"),
            fstab_entry: "data-0 /mnt/data virtiofs defaults 0 0".to_string(),
        }];
        let mut input = base_input(&env);
        input.volumes = &volumes;
        let args = synthesize_args(&input);

        assert!(args
            .iter()
            .any(|a| a == "memory-backend-file,id=qc-mem,size=1G,mem-path=/dev/shm,share=on"));
        assert_eq!(value_of(&args, "-numa"), ["node,memdev=qc-mem"]);

        let fstab_cred = args
            .iter()
            .find(|a| a.contains("fstab.extra="))
            .expect("fstab credential present");
        let b64 = fstab_cred.split("fstab.extra=").nth(1).unwrap();
        let decoded = BASE64.decode(b64).unwrap();
        assert_eq!(decoded, b"data-0 /mnt/data virtiofs defaults 0 0");
    }

    #[test]
    fn shared_memory_size_tracks_memory_override() {
        let env = BTreeMap::new();
        let volumes = vec![AcceptedVolume {
            index: 0,
            tag: "v-0".to_string(),
            socket_path: PathBuf::from("/i/virtiofs-v-0.sock"),
            fstab_entry: "v-0 /v virtiofs defaults 0 0".to_string(),
        }];
        let mut block = IndexMap::new();
        block.insert("m".to_string(), "8G".to_string());
        let config_args = vec![block];

        let mut input = base_input(&env);
        input.volumes = &volumes;
        input.config_args = &config_args;
        let args = synthesize_args(&input);

        assert!(args
            .iter()
            .any(|a| a.contains("size=8G,mem-path=/dev/shm")));
    }

    #[test]
    fn name_and_network_and_credentials() {
        let env = BTreeMap::new();
        let ports = vec!["8080:80".to_string()];

        let mut input = base_input(&env);
        input.vm_name = Some("My VM");
        input.cid = Some(1001);
        input.ports = &ports;
        let args = synthesize_args(&input);

        assert_eq!(args[0], "-name");
        assert_eq!(args[1], "My VM");
        assert!(args
            .iter()
            .any(|a| a == "type=11,value=io.systemd.credential:system.hostname=my-vm"));
        assert!(args
            .iter()
            .any(|a| a == "user,id=user.qemu-compose,hostname=my-vm,hostfwd=tcp::8080-:80"));
        assert!(args
            .iter()
            .any(|a| a == "vhost-vsock-pci,id=vhost-vsock-pci0,guest-cid=1001"));
        assert!(args
            .iter()
            .any(|a| a.ends_with("ssh.authorized_keys.root=UFVCS0VZ")));
    }

    #[test]
    fn network_none_skips_netdev() {
        let env = BTreeMap::new();
        let mut input = base_input(&env);
        input.network = Some("none");
        let args = synthesize_args(&input);

        assert!(!args.contains(&"-netdev".to_string()));
    }

    #[test]
    fn templates_expand_against_runtime_env() {
        let mut env = BTreeMap::new();
        env.insert("CWD".to_string(), "/work".to_string());

        let mut block = IndexMap::new();
        block.insert("cdrom".to_string(), "{CWD}/boot.iso".to_string());
        let config_args = vec![block];
        let manifest_args = vec!["-kernel".to_string(), "{CWD}/vmlinuz".to_string()];

        let mut input = base_input(&env);
        input.config_args = &config_args;
        input.manifest_args = &manifest_args;
        let args = synthesize_args(&input);

        assert_eq!(value_of(&args, "-cdrom"), ["/work/boot.iso"]);
        assert_eq!(value_of(&args, "-kernel"), ["/work/vmlinuz"]);
    }
}
