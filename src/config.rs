// SPDX-License-Identifier: GPL-2.0-or-later

use std::fs;
use std::io;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Embedded static-file server settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpServeConfig {
    #[serde(deserialize_with = "coerce::opt_scalar")]
    pub listen: Option<String>,
    #[serde(deserialize_with = "coerce::opt_scalar")]
    pub port: Option<String>,
    #[serde(deserialize_with = "coerce::opt_scalar")]
    pub root: Option<String>,
    #[serde(deserialize_with = "coerce::opt_scalar")]
    pub access_ip: Option<String>,
}

/// The user-facing machine declaration, parsed from the compose YAML or the
/// persisted `qemu_config.json` of an instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QemuConfig {
    pub name: Option<String>,
    pub binary: Option<String>,
    /// `none` or `user`; unset means `user`.
    pub network: Option<String>,
    pub image: Option<String>,
    pub instance: Option<String>,
    #[serde(deserialize_with = "coerce::scalar_map")]
    pub env: IndexMap<String, String>,
    /// Each map is a `-key value` fragment.
    #[serde(deserialize_with = "coerce::scalar_map_seq")]
    pub qemu_args: Vec<IndexMap<String, String>>,
    pub ports: Vec<String>,
    pub volumes: Vec<String>,
    pub boot_commands: Vec<serde_json::Value>,
    pub before_script: Vec<String>,
    pub after_script: Vec<String>,
    pub http_serve: Option<HttpServeConfig>,
}

impl QemuConfig {
    pub fn load_yaml(path: impl AsRef<Path>) -> io::Result<QemuConfig> {
        let content = fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(io::Error::other)
    }

    pub fn load_json(instance_dir: impl AsRef<Path>) -> io::Result<QemuConfig> {
        let content = fs::read_to_string(instance_dir.as_ref().join("qemu_config.json"))?;
        serde_json::from_str(&content).map_err(io::Error::other)
    }

    /// Persist to instance metadata for later reuse by `start`. Best-effort.
    pub fn save_to(&self, instance_dir: impl AsRef<Path>) {
        let path = instance_dir.as_ref().join("qemu_config.json");
        let result = serde_json::to_string(self)
            .map_err(io::Error::other)
            .and_then(|json| fs::write(&path, json));
        if let Err(err) = result {
            error!("failed to write qemu_config: {err}");
        }
    }

    /// Layer `self` (the CLI document) over a persisted config,
    /// field-by-field: set scalars win, non-empty collections win.
    pub fn merged_over(self, base: QemuConfig) -> QemuConfig {
        QemuConfig {
            name: self.name.or(base.name),
            binary: self.binary.or(base.binary),
            network: self.network.or(base.network),
            image: self.image.or(base.image),
            instance: self.instance.or(base.instance),
            env: if self.env.is_empty() { base.env } else { self.env },
            qemu_args: if self.qemu_args.is_empty() {
                base.qemu_args
            } else {
                self.qemu_args
            },
            ports: if self.ports.is_empty() {
                base.ports
            } else {
                self.ports
            },
            volumes: if self.volumes.is_empty() {
                base.volumes
            } else {
                self.volumes
            },
            boot_commands: if self.boot_commands.is_empty() {
                base.boot_commands
            } else {
                self.boot_commands
            },
            before_script: if self.before_script.is_empty() {
                base.before_script
            } else {
                self.before_script
            },
            after_script: if self.after_script.is_empty() {
                base.after_script
            } else {
                self.after_script
            },
            http_serve: self.http_serve.or(base.http_serve),
        }
    }
}

/// YAML scalars coerced to strings on the way in, so `port: 8000` and
/// `m: 2G` both work, the way the config has always been read.
mod coerce {
    use indexmap::IndexMap;
    use serde::{Deserialize, Deserializer};

    fn to_string<'de, D>(value: serde_json::Value) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        match value {
            serde_json::Value::String(s) => Ok(s),
            serde_json::Value::Number(n) => Ok(n.to_string()),
            serde_json::Value::Bool(b) => Ok(b.to_string()),
            other => Err(serde::de::Error::custom(format!(
                "expected a scalar, got {other}"
            ))),
        }
    }

    pub fn opt_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<serde_json::Value>::deserialize(deserializer)? {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => to_string::<D>(value).map(Some),
        }
    }

    pub fn scalar_map<'de, D>(deserializer: D) -> Result<IndexMap<String, String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = IndexMap::<String, serde_json::Value>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(k, v)| to_string::<D>(v).map(|v| (k, v)))
            .collect()
    }

    pub fn scalar_map_seq<'de, D>(
        deserializer: D,
    ) -> Result<Vec<IndexMap<String, String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<IndexMap<String, serde_json::Value>>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|block| {
                block
                    .into_iter()
                    .map(|(k, v)| to_string::<D>(v).map(|v| (k, v)))
                    .collect()
            })
            .collect()
    }
}

/// Default compose file discovery for `up`.
pub fn guess_config_path(explicit: Option<&Path>) -> Option<std::path::PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    for candidate in ["qemu-compose.yml", "qemu-compose.yaml"] {
        let path = Path::new(candidate);
        if path.exists() {
            return Some(path.to_path_buf());
        }
    }
    None
}
