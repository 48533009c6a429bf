// SPDX-License-Identifier: GPL-2.0-or-later

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::util::parse_datetime;

/// One disk entry of a manifest. Serialized as `[filename, format?, opts?]`
/// with `format` defaulting to `qcow2` and `opts` to empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub filename: String,
    pub format: String,
    pub opts: String,
}

impl DiskSpec {
    pub fn from_array(a: &[Value]) -> Option<DiskSpec> {
        let filename = a.first()?.as_str()?.to_string();
        let format = a
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or("qcow2")
            .to_string();
        let opts = a.get(2).and_then(Value::as_str).unwrap_or("").to_string();
        Some(DiskSpec {
            filename,
            format,
            opts,
        })
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::String(self.filename.clone()),
            Value::String(self.format.clone()),
            Value::String(self.opts.clone()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoTag {
    pub repo: String,
    pub tag: String,
}

impl RepoTag {
    /// Parse `repo[:tag]`; a bare repo defaults to tag `latest`.
    pub fn parse(s: &str) -> RepoTag {
        match s.split_once(':') {
            Some((repo, tag)) => RepoTag {
                repo: repo.to_string(),
                tag: tag.to_string(),
            },
            None => RepoTag {
                repo: s.to_string(),
                tag: "latest".to_string(),
            },
        }
    }

    pub fn matches_name(&self, name: &str) -> bool {
        let wanted = RepoTag::parse(name);
        self.repo == wanted.repo && self.tag == wanted.tag
    }
}

impl fmt::Display for RepoTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repo, self.tag)
    }
}

/// Read-only description of a materialized image directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageManifest {
    pub id: String,
    pub architecture: String,
    pub os: String,
    pub created: DateTime<Utc>,
    pub repo_tags: Vec<RepoTag>,
    pub disks: Vec<DiskSpec>,
    pub qemu_args: Vec<String>,
    pub digest: String,
    pub comment: Option<String>,
}

fn coerce_string(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

impl ImageManifest {
    pub fn load(image_dir: impl AsRef<Path>) -> io::Result<ImageManifest> {
        let raw = fs::read_to_string(image_dir.as_ref().join("manifest.json"))?;
        let obj: Value = serde_json::from_str(&raw)?;
        Ok(ImageManifest::from_value(&obj))
    }

    /// Defensive parse: unknown fields ignored, malformed entries skipped,
    /// scalar fields string-coerced, missing `created` is the epoch.
    pub fn from_value(obj: &Value) -> ImageManifest {
        let repo_tags = obj
            .get("repo_tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(RepoTag::parse)
                    .collect()
            })
            .unwrap_or_default();

        let disks = obj
            .get("disks")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|item| item.as_array().and_then(|a| DiskSpec::from_array(a)))
                    .collect()
            })
            .unwrap_or_default();

        let qemu_args = obj
            .get("qemu_args")
            .and_then(Value::as_array)
            .map(|args| {
                args.iter()
                    .filter_map(|a| match a {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let comment = match obj.get("comment") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        ImageManifest {
            id: coerce_string(obj.get("id")),
            architecture: coerce_string(obj.get("architecture")),
            os: coerce_string(obj.get("os")),
            created: parse_datetime(obj.get("created").unwrap_or(&Value::Null)),
            repo_tags,
            disks,
            qemu_args,
            digest: coerce_string(obj.get("digest")),
            comment,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "architecture": self.architecture,
            "os": self.os,
            "created": self.created.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "repo_tags": self.repo_tags.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
            "disks": self.disks.iter().map(|d| d.to_value()).collect::<Vec<_>>(),
            "qemu_args": self.qemu_args,
            "digest": self.digest,
            "comment": self.comment,
        })
    }

    pub fn has_repo_tag(&self, name: &str) -> bool {
        self.repo_tags.iter().any(|rt| rt.matches_name(name))
    }

    /// Twelve characters after the algorithm tag, or of the raw digest.
    pub fn short_id(&self) -> String {
        if self.digest.is_empty() {
            return "<none>".to_string();
        }
        let hex = self
            .digest
            .strip_prefix("sha256:")
            .unwrap_or(&self.digest);
        hex.chars().take(12).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("fedora:40", "fedora", "40")]
    #[test_case("fedora", "fedora", "latest")]
    #[test_case("registry/img:v1.2", "registry/img", "v1.2")]
    fn repo_tag_parse(input: &str, repo: &str, tag: &str) {
        let rt = RepoTag::parse(input);
        assert_eq!(rt.repo, repo);
        assert_eq!(rt.tag, tag);
    }

    #[test]
    fn repo_tag_round_trip() {
        let rt = RepoTag::parse("fedora:40");
        assert_eq!(RepoTag::parse(&rt.to_string()), rt);
        assert!(rt.matches_name("fedora:40"));
        assert!(!rt.matches_name("fedora"));
        assert!(RepoTag::parse("fedora:latest").matches_name("fedora"));
    }

    #[test]
    fn disk_spec_defaults() {
        let spec =
            DiskSpec::from_array(&[serde_json::json!("disk.qcow2")]).unwrap();
        assert_eq!(spec.format, "qcow2");
        assert_eq!(spec.opts, "");

        let full = DiskSpec::from_array(&[
            serde_json::json!("root.img"),
            serde_json::json!("raw"),
            serde_json::json!("if=virtio"),
        ])
        .unwrap();
        assert_eq!(full.format, "raw");
        assert_eq!(full.opts, "if=virtio");
    }

    #[test]
    fn manifest_defensive_parse() {
        let obj = serde_json::json!({
            "id": "abc123",
            "digest": "sha256:0123456789abcdef0123",
            "created": "2024-01-02T03:04:05Z",
            "repo_tags": ["fedora:40", 42, "plain"],
            "disks": [["disk.qcow2"], "not-a-list", [["nested"]]],
            "qemu_args": ["-m", 2048, {"bad": true}],
            "unknown_field": {"ignored": true},
        });

        let m = ImageManifest::from_value(&obj);
        assert_eq!(m.id, "abc123");
        assert_eq!(m.short_id(), "0123456789ab");
        assert_eq!(m.repo_tags.len(), 2);
        assert!(m.has_repo_tag("plain:latest"));
        assert_eq!(m.disks.len(), 1);
        assert_eq!(m.qemu_args, vec!["-m".to_string(), "2048".to_string()]);
        assert!(m.comment.is_none());
    }

    #[test]
    fn manifest_missing_created_is_epoch() {
        let m = ImageManifest::from_value(&serde_json::json!({"id": "x"}));
        assert_eq!(m.created.timestamp(), 0);
    }

    #[test]
    fn manifest_round_trip() {
        let obj = serde_json::json!({
            "id": "abc123",
            "architecture": "x86_64",
            "os": "linux",
            "digest": "sha256:feedface0000",
            "created": "2024-01-02T03:04:05Z",
            "repo_tags": ["fedora:40"],
            "disks": [["disk.qcow2", "qcow2", "if=virtio"]],
            "qemu_args": ["-vga", "none"],
            "comment": "test image",
        });

        let m = ImageManifest::from_value(&obj);
        let again = ImageManifest::from_value(&m.to_value());
        assert_eq!(m, again);
    }
}
