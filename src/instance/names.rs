// SPDX-License-Identifier: GPL-2.0-or-later

use std::collections::BTreeMap;
use std::path::Path;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{Error, Result};
use crate::instance::build_name_index;

const ADJECTIVES: &[&str] = &[
    "agile", "brisk", "calm", "daring", "eager", "fancy", "gentle", "happy", "jolly", "kind",
    "lively", "merry", "nimble", "proud", "quick", "ready", "smart", "tidy", "upbeat", "vivid",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "clover", "comet", "falcon", "feather", "harbor", "heron", "island",
    "jungle", "meadow", "nebula", "otter", "prairie", "quartz", "ranger", "spruce", "talon",
    "valley", "willow",
];

const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Pick an adjective-noun name not present in `existing`; once the plain
/// combinations are exhausted, fall back to a random 4-char suffix.
pub fn generate_unique_name(existing: &BTreeMap<String, String>) -> String {
    let mut rng = rand::thread_rng();

    let max_attempts = ADJECTIVES.len() * NOUNS.len();
    for _ in 0..max_attempts {
        let candidate = format!(
            "{}-{}",
            ADJECTIVES.choose(&mut rng).unwrap_or(&"calm"),
            NOUNS.choose(&mut rng).unwrap_or(&"otter"),
        );
        if !existing.contains_key(&candidate) {
            return candidate;
        }
    }

    loop {
        let suffix: String = (0..4)
            .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
            .collect();
        let candidate = format!(
            "{}-{}-{}",
            ADJECTIVES.choose(&mut rng).unwrap_or(&"calm"),
            NOUNS.choose(&mut rng).unwrap_or(&"otter"),
            suffix,
        );
        if !existing.contains_key(&candidate) {
            return candidate;
        }
    }
}

/// Assert the requested name is free, or synthesize one. Uniqueness is
/// checked against every `<instance>/name` file at this moment.
pub fn check_and_get_name(
    instance_root: impl AsRef<Path>,
    requested: Option<&str>,
) -> Result<String> {
    let existing = build_name_index(instance_root);

    match requested {
        Some(name) => match existing.get(name) {
            Some(vmid) => Err(Error::NameInUse {
                name: name.to_string(),
                vmid: vmid.clone(),
            }),
            None => Ok(name.to_string()),
        },
        None => Ok(generate_unique_name(&existing)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn generated_names_avoid_existing() {
        let mut existing = BTreeMap::new();
        for adjective in ADJECTIVES {
            for noun in NOUNS {
                existing.insert(format!("{adjective}-{noun}"), "taken".to_string());
            }
        }
        let name = generate_unique_name(&existing);
        assert!(!existing.contains_key(&name));
        // exhausted plain combinations force the suffixed form
        assert_eq!(name.split('-').count(), 3);
    }

    #[test]
    fn requested_name_collision_reports_owner() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("abcdefabcdef");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("name"), "web").unwrap();

        match check_and_get_name(tmp.path(), Some("web")) {
            Err(Error::NameInUse { name, vmid }) => {
                assert_eq!(name, "web");
                assert_eq!(vmid, "abcdefabcdef");
            }
            other => panic!("expected NameInUse, got {:?}", other.map(|_| ())),
        }

        assert_eq!(check_and_get_name(tmp.path(), Some("db")).unwrap(), "db");
    }
}
