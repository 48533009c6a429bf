// SPDX-License-Identifier: GPL-2.0-or-later

use std::io;
use std::path::PathBuf;

use crate::interp::InterpError;

/// What kind of object an ambiguous identifier was supposed to name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentKind {
    Image,
    Instance,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("image not found: {token}")]
    ImageNotFound { token: String },

    #[error("instance not found: {token}")]
    InstanceNotFound { token: String },

    #[error("identifier '{token}' is ambiguous; matches: {}", preview_matches(.matches))]
    Ambiguous {
        kind: IdentKind,
        token: String,
        matches: Vec<String>,
    },

    #[error(
        "creating vm storage: the vm name {name} is already in use by {vmid}. \
         You have to remove that instance to be able to reuse that name: \
         that name is already in use"
    )]
    NameInUse { name: String, vmid: String },

    #[error("no available guest cid found, please make sure vhost_vsock module loaded")]
    NoCidAvailable,

    #[error("failed to lock instance dir {dir}")]
    LockBusy { dir: PathBuf },

    #[error("failed to create instance dir {dir}: {source}")]
    DirectoryCreate { dir: PathBuf, source: io::Error },

    #[error("failed to create overlay for disk {filename}")]
    OverlayCreateFailed { filename: String, code: i32 },

    #[error("'{binary}' binary not found in PATH")]
    HelperMissing { binary: String },

    #[error("abnormal shutdown: {0}")]
    AbnormalShutdown(#[source] io::Error),

    #[error("boot script failed: {0}")]
    Interpreter(#[from] InterpError),

    #[error("{script} line failed with exit code {code}: {line}")]
    ScriptFailed {
        script: &'static str,
        line: String,
        code: i32,
    },

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

fn preview_matches(matches: &[String]) -> String {
    let mut sorted = matches.to_vec();
    sorted.sort();
    sorted.dedup();
    let total = sorted.len();
    let preview = sorted
        .iter()
        .take(8)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if total > 8 {
        format!("{} ... and {} more", preview, total - 8)
    } else {
        preview
    }
}

impl Error {
    /// Process exit code surfaced for this failure, matching podman where a
    /// counterpart exists.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ImageNotFound { .. } => 126,
            Error::InstanceNotFound { .. } => 125,
            Error::Ambiguous { kind, .. } => match kind {
                IdentKind::Image => 1,
                IdentKind::Instance => 125,
            },
            Error::NameInUse { .. } => 125,
            Error::NoCidAvailable => 124,
            Error::LockBusy { .. } => 122,
            Error::DirectoryCreate { .. } => 123,
            Error::OverlayCreateFailed { code, .. } => *code,
            Error::HelperMissing { .. } => 127,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(
            Error::ImageNotFound {
                token: "x".to_string()
            }
            .exit_code(),
            126
        );
        assert_eq!(Error::NoCidAvailable.exit_code(), 124);
        assert_eq!(
            Error::LockBusy {
                dir: PathBuf::from("/tmp/i")
            }
            .exit_code(),
            122
        );
        assert_eq!(
            Error::NameInUse {
                name: "a".to_string(),
                vmid: "b".to_string()
            }
            .exit_code(),
            125
        );
        assert_eq!(
            Error::HelperMissing {
                binary: "qemu-img".to_string()
            }
            .exit_code(),
            127
        );
        assert_eq!(
            Error::OverlayCreateFailed {
                filename: "disk.qcow2".to_string(),
                code: 3
            }
            .exit_code(),
            3
        );
    }

    #[test]
    fn ambiguous_preview_caps_at_eight() {
        let matches: Vec<String> = (0..11).map(|i| format!("id{:02}", i)).collect();
        let err = Error::Ambiguous {
            kind: IdentKind::Instance,
            token: "id".to_string(),
            matches,
        };
        let msg = err.to_string();
        assert!(msg.contains("id00"));
        assert!(msg.contains("... and 3 more"));
        assert_eq!(err.exit_code(), 125);
    }
}
