// SPDX-License-Identifier: GPL-2.0-or-later

use std::path::Path;

use tracing::warn;

use crate::commands::{execute_session, register_interrupt};
use crate::config::QemuConfig;
use crate::error::Result;
use crate::instance::resolve_instance;
use crate::instance::runner::Runner;
use crate::store::LocalStore;

/// Restart an existing instance, merging the CLI config over the persisted
/// one field-by-field.
pub fn start(identifier: &str, file: Option<&Path>) -> Result<()> {
    let store = LocalStore::new()?;
    let instance_root = store.instance_root()?;

    let vmid = resolve_instance(&instance_root, identifier)?;

    let mut cli_config = match file {
        Some(path) => QemuConfig::load_yaml(path)?,
        None => QemuConfig::default(),
    };
    cli_config.instance = Some(vmid.clone());

    let config = match store
        .instance_dir(&vmid)
        .map_err(crate::error::Error::Io)
        .and_then(|dir| QemuConfig::load_json(dir).map_err(crate::error::Error::Io))
    {
        Ok(persisted) => cli_config.merged_over(persisted),
        Err(err) => {
            warn!("no persisted config for {vmid}: {err}");
            cli_config
        }
    };

    let cwd = std::env::current_dir()?;
    let interrupt = register_interrupt()?;

    execute_session(Runner::new(config, store, cwd, interrupt))
}
