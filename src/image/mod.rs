// SPDX-License-Identifier: GPL-2.0-or-later

mod manifest;

pub use manifest::{DiskSpec, ImageManifest, RepoTag};

use std::fs;
use std::path::Path;

use chrono::Utc;
use tracing::debug;

use crate::util::{human_readable_size, humanize_age};

/// Subdirectory names of a root, sorted. Missing root is an empty list.
pub fn list_subdirs(root: impl AsRef<Path>) -> Vec<String> {
    let mut out = match fs::read_dir(root) {
        Ok(entries) => entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect::<Vec<_>>(),
        Err(_) => Vec::new(),
    };
    out.sort();
    out
}

/// Enumerate parseable manifests under `image_root`, skipping broken entries.
pub fn list_images(image_root: impl AsRef<Path>) -> Vec<ImageManifest> {
    let image_root = image_root.as_ref();
    list_subdirs(image_root)
        .into_iter()
        .filter_map(
            |id| match ImageManifest::load(image_root.join(&id)) {
                Ok(m) => Some(m),
                Err(err) => {
                    debug!("skipping image directory {id}: {err}");
                    None
                }
            },
        )
        .collect()
}

pub fn load_image_by_id(image_root: impl AsRef<Path>, image_id: &str) -> Option<ImageManifest> {
    let dir = image_root.as_ref().join(image_id);
    if !dir.is_dir() {
        return None;
    }
    ImageManifest::load(&dir).ok()
}

/// Match a manifest whose `repo_tags` contains `name`; bare names match tag
/// `latest`.
pub fn load_image_by_name(image_root: impl AsRef<Path>, name: &str) -> Option<ImageManifest> {
    list_images(image_root)
        .into_iter()
        .find(|m| m.has_repo_tag(name))
}

/// Resolve a user token: exact repo tag first, then exact id, then unique id
/// prefix. Returns the resolved id (if unambiguous) plus the candidate list
/// for diagnostics.
pub fn resolve_image(
    image_root: impl AsRef<Path>,
    token: &str,
) -> (Option<String>, Vec<String>) {
    let image_root = image_root.as_ref();

    if let Some(found) = load_image_by_name(image_root, token) {
        return (Some(found.id.clone()), vec![found.id]);
    }

    let ids = list_subdirs(image_root);
    if ids.iter().any(|i| i == token) {
        return (Some(token.to_string()), vec![token.to_string()]);
    }

    let matches: Vec<String> = ids.into_iter().filter(|i| i.starts_with(token)).collect();
    if matches.len() == 1 {
        return (Some(matches[0].clone()), matches);
    }

    (None, matches)
}

/// One `images` table row per repo tag: REPOSITORY, TAG, IMAGE ID, CREATED,
/// SIZE.
pub fn image_rows(image_root: impl AsRef<Path>) -> Vec<[String; 5]> {
    let image_root = image_root.as_ref();
    let now = Utc::now();
    let mut rows = Vec::new();

    for manifest in list_images(image_root) {
        let image_dir = image_root.join(&manifest.id);
        let size: u64 = manifest
            .disks
            .iter()
            .map(|d| {
                fs::metadata(image_dir.join(&d.filename))
                    .map(|m| m.len())
                    .unwrap_or(0)
            })
            .sum();

        let short_id = manifest.short_id();
        let created = humanize_age(manifest.created, now);
        let size_human = human_readable_size(size);

        for rt in &manifest.repo_tags {
            rows.push([
                if rt.repo.is_empty() {
                    "<none>".to_string()
                } else {
                    rt.repo.clone()
                },
                if rt.tag.is_empty() {
                    "<none>".to_string()
                } else {
                    rt.tag.clone()
                },
                short_id.clone(),
                created.clone(),
                size_human.clone(),
            ]);
        }
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(image_root: &Path, id: &str, manifest: serde_json::Value) {
        let dir = image_root.join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("manifest.json"),
            serde_json::to_string(&manifest).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn empty_image_root() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(list_images(tmp.path()).is_empty());
        assert_eq!(resolve_image(tmp.path(), "x"), (None, vec![]));
    }

    #[test]
    fn unique_prefix_resolves() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "abc123", serde_json::json!({"id": "abc123"}));
        write_manifest(tmp.path(), "def456", serde_json::json!({"id": "def456"}));

        let (id, matches) = resolve_image(tmp.path(), "abc");
        assert_eq!(id.as_deref(), Some("abc123"));
        assert_eq!(matches, vec!["abc123".to_string()]);
    }

    #[test]
    fn ambiguous_prefix_is_unresolved() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "abc1", serde_json::json!({"id": "abc1"}));
        write_manifest(tmp.path(), "abc2", serde_json::json!({"id": "abc2"}));

        let (id, matches) = resolve_image(tmp.path(), "abc");
        assert!(id.is_none());
        assert_eq!(matches, vec!["abc1".to_string(), "abc2".to_string()]);
    }

    #[test]
    fn name_wins_over_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(
            tmp.path(),
            "abc1",
            serde_json::json!({"id": "abc1", "repo_tags": ["foo:latest"]}),
        );
        write_manifest(tmp.path(), "abc2", serde_json::json!({"id": "abc2"}));

        let (id, matches) = resolve_image(tmp.path(), "foo");
        assert_eq!(id.as_deref(), Some("abc1"));
        assert_eq!(matches, vec!["abc1".to_string()]);
    }

    #[test]
    fn broken_manifest_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "good", serde_json::json!({"id": "good"}));
        let bad = tmp.path().join("bad");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("manifest.json"), "{ not json").unwrap();

        let images = list_images(tmp.path());
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, "good");
    }

    #[test]
    fn exact_id_beats_prefix_of_other() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "abc", serde_json::json!({"id": "abc"}));
        write_manifest(tmp.path(), "abcdef", serde_json::json!({"id": "abcdef"}));

        let (id, _) = resolve_image(tmp.path(), "abc");
        assert_eq!(id.as_deref(), Some("abc"));
    }
}
