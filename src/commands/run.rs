// SPDX-License-Identifier: GPL-2.0-or-later

use crate::commands::{execute_session, register_interrupt};
use crate::config::QemuConfig;
use crate::error::{Error, IdentKind, Result};
use crate::image::resolve_image;
use crate::instance::runner::Runner;
use crate::store::LocalStore;

/// Run a new instance from an image reference (name, id, or unique id
/// prefix).
pub fn run(image: &str, name: Option<&str>, ports: &[String], volumes: &[String]) -> Result<()> {
    let store = LocalStore::new()?;
    let image_root = store.image_root()?;

    let (resolved, matches) = resolve_image(&image_root, image);
    let resolved = match resolved {
        Some(id) => id,
        None if matches.is_empty() => {
            return Err(Error::ImageNotFound {
                token: image.to_string(),
            })
        }
        None => {
            return Err(Error::Ambiguous {
                kind: IdentKind::Image,
                token: image.to_string(),
                matches,
            })
        }
    };

    let config = QemuConfig {
        name: name.map(str::to_string),
        image: Some(resolved),
        ports: ports.to_vec(),
        volumes: volumes.to_vec(),
        ..QemuConfig::default()
    };

    let cwd = std::env::current_dir()?;
    let interrupt = register_interrupt()?;

    execute_session(Runner::new(config, store, cwd, interrupt))
}
