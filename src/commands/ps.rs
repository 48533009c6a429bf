// SPDX-License-Identifier: GPL-2.0-or-later

use crate::error::Result;
use crate::instance::{collect_instances, InstanceMeta};
use crate::store::LocalStore;

const ID_WIDTH: usize = 12;
const CID_WIDTH: usize = 6;
const PID_WIDTH: usize = 8;

/// List instances; running only unless `show_all`.
pub fn ps(show_all: bool) -> Result<()> {
    let store = LocalStore::new()?;
    let instance_root = store.instance_root()?;

    let instances: Vec<InstanceMeta> = collect_instances(instance_root)
        .into_iter()
        .filter(|m| show_all || m.is_running())
        .collect();

    print!("{}", render_table(&instances));
    Ok(())
}

fn render_table(instances: &[InstanceMeta]) -> String {
    let id_width = ID_WIDTH;
    let cid_width = CID_WIDTH;
    let pid_width = PID_WIDTH;
    let name_width = column_width("NAME", instances.iter().map(|m| m.name.as_deref()));
    let image_width = column_width("IMAGE", instances.iter().map(|m| m.image.as_deref()));

    let header = format!(
        "{:<id_width$}  {:<name_width$}  {:<image_width$}  {:<cid_width$}  {:<pid_width$}  STATUS",
        "INSTANCE_ID", "NAME", "IMAGE", "CID", "QEMU PID",
    );

    let mut lines = vec![header.clone(), "-".repeat(header.len())];

    for meta in instances {
        let status = if meta.is_running() { "running" } else { "exited" };
        let iid: String = meta.instance_id.chars().take(ID_WIDTH).collect();
        let name = meta.name.as_deref().unwrap_or("-");
        let image = meta.image.as_deref().unwrap_or("-");
        let cid = meta.cid.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
        let pid = meta.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());

        lines.push(format!(
            "{iid:<id_width$}  {name:<name_width$}  {image:<image_width$}  \
             {cid:>cid_width$}  {pid:>pid_width$}  {status}"
        ));
    }

    lines.join("\n") + "\n"
}

fn column_width<'a>(header: &str, values: impl Iterator<Item = Option<&'a str>>) -> usize {
    values
        .map(|v| v.unwrap_or("-").len())
        .chain(std::iter::once(header.len()))
        .max()
        .unwrap_or(header.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_adapts_name_and_image_widths() {
        let instances = vec![
            InstanceMeta {
                instance_id: "abcdefabcdefEXTRA".to_string(),
                name: Some("a-rather-long-instance-name".to_string()),
                image: Some("archlinux".to_string()),
                cid: Some(1000),
                pid: None,
            },
            InstanceMeta {
                instance_id: "xyzxyzxyzxyz".to_string(),
                name: None,
                image: None,
                cid: None,
                pid: None,
            },
        ];

        let table = render_table(&instances);
        let lines: Vec<&str> = table.lines().collect();

        assert!(lines[0].starts_with("INSTANCE_ID"));
        assert!(lines[0].contains("QEMU PID"));
        // id truncated to 12 characters
        assert!(lines[2].starts_with("abcdefabcdef "));
        assert!(lines[2].contains("a-rather-long-instance-name"));
        assert!(lines[3].contains(" - "));
    }
}
