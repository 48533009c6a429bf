// SPDX-License-Identifier: GPL-2.0-or-later

use std::path::{Path, PathBuf};

use crate::commands::{execute_session, register_interrupt};
use crate::config::{guess_config_path, QemuConfig};
use crate::error::{Error, Result};
use crate::instance::runner::Runner;
use crate::store::LocalStore;

/// Create and start a VM from the compose file.
pub fn up(file: Option<&Path>, project_directory: Option<&Path>) -> Result<()> {
    let config_path =
        guess_config_path(file).ok_or_else(|| Error::Other("qemu-compose.yml not found".to_string()))?;

    let config = QemuConfig::load_yaml(&config_path)?;

    let cwd: PathBuf = match project_directory {
        Some(dir) => dir.canonicalize()?,
        None => config_path
            .canonicalize()?
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let store = LocalStore::new()?;
    let interrupt = register_interrupt()?;

    execute_session(Runner::new(config, store, cwd, interrupt))
}
