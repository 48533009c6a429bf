// SPDX-License-Identifier: GPL-2.0-or-later

use std::os::unix::process::CommandExt;
use std::process::Command;

use crate::error::{Error, Result};
use crate::instance::resolve_instance;
use crate::store::LocalStore;
use crate::util::safe_read;

/// Exec the external `ssh` against `root@vsock%<cid>` with the instance
/// key. The first token that resolves to an instance is the target; every
/// other token passes through to ssh. With nothing to pass through, print
/// the constructed command instead.
pub fn ssh(args: &[String]) -> Result<()> {
    if args.is_empty() {
        eprintln!("Usage:  qemu-compose ssh [OPTIONS] VMID COMMAND [ARG...]");
        return Err(Error::Other("missing instance identifier".to_string()));
    }

    let store = LocalStore::new()?;
    let instance_root = store.instance_root()?;

    let mut vmid = None;
    let mut vmid_index = 0;
    for (i, token) in args.iter().enumerate() {
        if let Ok(resolved) = resolve_instance(&instance_root, token) {
            vmid = Some(resolved);
            vmid_index = i;
            break;
        }
    }

    let Some(vmid) = vmid else {
        eprintln!(
            "Error: VMID not found. Existing instances live under {}",
            instance_root.display()
        );
        return Err(Error::InstanceNotFound {
            token: args[0].clone(),
        });
    };

    let instance_dir = instance_root.join(&vmid);
    let key_path = instance_dir.join("ssh-key");
    if !key_path.exists() {
        return Err(Error::Other(format!(
            "instance key not found: {}",
            key_path.display()
        )));
    }

    let mut ssh_cmd: Vec<String> = vec![
        "ssh".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-i".to_string(),
        key_path.display().to_string(),
    ];

    match safe_read(instance_dir.join("cid")) {
        Some(cid) => ssh_cmd.push(format!("root@vsock%{cid}")),
        None => ssh_cmd.push("root@vsock%${cid}".to_string()),
    }

    let passthrough: Vec<&String> = args
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != vmid_index)
        .map(|(_, a)| a)
        .collect();

    if passthrough.is_empty() {
        // show the defaults so users can compose their own invocation
        let printable: Vec<String> = ssh_cmd.iter().map(|a| shell_quote(a)).collect();
        println!("{}", printable.join(" "));
        return Ok(());
    }

    ssh_cmd.extend(passthrough.into_iter().cloned());

    let err = Command::new(&ssh_cmd[0]).args(&ssh_cmd[1..]).exec();
    if err.kind() == std::io::ErrorKind::NotFound {
        Err(Error::HelperMissing {
            binary: "ssh".to_string(),
        })
    } else {
        Err(Error::Io(err))
    }
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%_-+=:,./".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("root@vsock%1000"), "root@vsock%1000");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("don't"), r"'don'\''t'");
    }
}
