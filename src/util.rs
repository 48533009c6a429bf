// SPDX-License-Identifier: GPL-2.0-or-later

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

/// Read a small metadata file, returning `None` on any error or when the
/// trimmed content is empty.
pub fn safe_read(path: impl AsRef<Path>) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Translate an arbitrary VM name to a valid Linux hostname label: keep only
/// `[a-z0-9-]`, collapse runs of other characters to a single `-`, trim,
/// truncate to 63 chars, fall back to `vm` when nothing survives.
pub fn to_valid_hostname(name: &str) -> String {
    lazy_static! {
        static ref INVALID: Regex = Regex::new(r"[^a-z0-9-]+").unwrap();
        static ref DASHES: Regex = Regex::new(r"-+").unwrap();
    }

    let lowered = name.to_lowercase();
    let replaced = INVALID.replace_all(&lowered, "-");
    let collapsed = DASHES.replace_all(&replaced, "-");
    let mut s = collapsed.trim_matches('-').to_string();
    s.truncate(63);
    // truncation may expose a trailing '-'
    let s = s.trim_matches('-').to_string();
    if s.is_empty() {
        "vm".to_string()
    } else {
        s
    }
}

pub fn human_readable_size(num_bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut size = num_bytes as f64;
    for unit in UNITS {
        if size < 1024.0 || unit == "TB" {
            return format!("{:.1}{}", size, unit);
        }
        size /= 1024.0;
    }
    unreachable!()
}

pub fn humanize_age(created: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - created).num_seconds().max(0);
    if seconds < 60 {
        return format!("{}s ago", seconds);
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{}m ago", minutes);
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{}h ago", hours);
    }
    let days = hours / 24;
    if days < 30 {
        return format!("{}d ago", days);
    }
    let months = days / 30;
    if months < 12 {
        return format!("{}mo ago", months);
    }
    format!("{}y ago", months / 12)
}

/// Parse a manifest `created` value: RFC-3339 (trailing `Z` permitted) or
/// epoch seconds. Anything unparseable collapses to the epoch.
pub fn parse_datetime(value: &serde_json::Value) -> DateTime<Utc> {
    let epoch = Utc.timestamp_opt(0, 0).single().unwrap_or_default();

    match value {
        serde_json::Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                Utc.timestamp_opt(secs, 0).single().unwrap_or(epoch)
            } else if let Some(secs) = n.as_f64() {
                Utc.timestamp_opt(secs as i64, 0).single().unwrap_or(epoch)
            } else {
                epoch
            }
        }
        serde_json::Value::String(s) if !s.trim().is_empty() => {
            DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(epoch)
        }
        _ => epoch,
    }
}

/// Expand `{NAME}` placeholders against the runtime environment map. Only
/// enumerated keys are substituted; unknown placeholders pass through
/// untouched, and `{{`/`}}` escape to literal braces.
pub fn expand_placeholders(template: &str, env: &BTreeMap<String, String>) -> String {
    lazy_static! {
        static ref PLACEHOLDER: Regex = Regex::new(r"^\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix("{{") {
            out.push('{');
            rest = stripped;
            continue;
        }
        if let Some(stripped) = rest.strip_prefix("}}") {
            out.push('}');
            rest = stripped;
            continue;
        }

        if let Some(caps) = PLACEHOLDER.captures(rest) {
            let whole = caps.get(0).unwrap();
            let key = caps.get(1).unwrap().as_str();
            match env.get(key) {
                Some(value) => out.push_str(value),
                None => out.push_str(whole.as_str()),
            }
            rest = &rest[whole.end()..];
            continue;
        }

        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }

    out
}

/// Controlling-terminal dimensions, `(rows, cols)`. Falls back to 24x80 when
/// no standard stream is a terminal.
pub fn terminal_size() -> (u16, u16) {
    nix::ioctl_read_bad!(tiocgwinsz, nix::libc::TIOCGWINSZ, nix::libc::winsize);

    let mut ws = nix::libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    for fd in [1, 0] {
        // SAFETY: fd is a standard stream and ws outlives the call
        let ok = unsafe { tiocgwinsz(fd, &mut ws) }.is_ok();
        if ok && ws.ws_row != 0 && ws.ws_col != 0 {
            return (ws.ws_row, ws.ws_col);
        }
    }

    (24, 80)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("My VM", "my-vm")]
    #[test_case("  spaced   out  ", "spaced-out")]
    #[test_case("___", "vm")]
    #[test_case("Already-valid-name", "already-valid-name")]
    #[test_case("mixed_CASE.name", "mixed-case-name")]
    fn hostname_derivation(input: &str, expected: &str) {
        assert_eq!(to_valid_hostname(input), expected);
    }

    #[test]
    fn hostname_is_idempotent() {
        for s in ["Some Name!", "--x--", "ALL_CAPS", "weird*chars*"] {
            let once = to_valid_hostname(s);
            assert_eq!(to_valid_hostname(&once), once);
        }
    }

    #[test]
    fn hostname_truncates_to_63() {
        let long = "a".repeat(100);
        assert_eq!(to_valid_hostname(&long).len(), 63);
    }

    #[test_case(0, "0.0B")]
    #[test_case(1023, "1023.0B")]
    #[test_case(1024, "1.0KB")]
    #[test_case(1536, "1.5KB")]
    #[test_case(1024 * 1024, "1.0MB")]
    fn sizes(bytes: u64, expected: &str) {
        assert_eq!(human_readable_size(bytes), expected);
    }

    #[test]
    fn age_buckets() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let at = |secs: i64| now - chrono::Duration::seconds(secs);

        assert_eq!(humanize_age(at(5), now), "5s ago");
        assert_eq!(humanize_age(at(61), now), "1m ago");
        assert_eq!(humanize_age(at(3 * 3600), now), "3h ago");
        assert_eq!(humanize_age(at(2 * 86400), now), "2d ago");
        assert_eq!(humanize_age(at(40 * 86400), now), "1mo ago");
        assert_eq!(humanize_age(at(400 * 86400), now), "1y ago");
    }

    #[test]
    fn datetime_z_equals_offset() {
        let a = parse_datetime(&serde_json::json!("2024-01-02T03:04:05Z"));
        let b = parse_datetime(&serde_json::json!("2024-01-02T03:04:05+00:00"));
        assert_eq!(a, b);
    }

    #[test]
    fn datetime_epoch_seconds() {
        let dt = parse_datetime(&serde_json::json!(1700000000));
        assert_eq!(dt.timestamp(), 1700000000);
    }

    #[test]
    fn datetime_garbage_is_epoch() {
        assert_eq!(
            parse_datetime(&serde_json::json!("not a date")).timestamp(),
            0
        );
        assert_eq!(parse_datetime(&serde_json::Value::Null).timestamp(), 0);
    }

    #[test]
    fn placeholder_expansion() {
        let mut env = BTreeMap::new();
        env.insert("ID".to_string(), "abc".to_string());
        env.insert("HTTP_PORT".to_string(), "8888".to_string());

        assert_eq!(
            expand_placeholders("http://{GATEWAY}:{HTTP_PORT}/{ID}", &env),
            "http://{GATEWAY}:8888/abc"
        );
        assert_eq!(expand_placeholders("{{literal}}", &env), "{literal}");
        assert_eq!(
            expand_placeholders("no placeholders", &env),
            "no placeholders"
        );
    }
}
