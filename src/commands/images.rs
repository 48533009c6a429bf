// SPDX-License-Identifier: GPL-2.0-or-later

use crate::error::Result;
use crate::image::image_rows;
use crate::store::LocalStore;

const HEADERS: [&str; 5] = ["REPOSITORY", "TAG", "IMAGE ID", "CREATED", "SIZE"];

/// List local images, one row per repo tag.
pub fn images() -> Result<()> {
    let store = LocalStore::new()?;
    let rows = image_rows(store.image_root()?);
    print!("{}", render_table(&rows));
    Ok(())
}

fn render_table(rows: &[[String; 5]]) -> String {
    let widths: Vec<usize> = (0..HEADERS.len())
        .map(|col| {
            rows.iter()
                .map(|r| r[col].len())
                .chain(std::iter::once(HEADERS[col].len()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let fmt_row = |cells: &[&str]| -> String {
        cells
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{:<width$}", cell, width = widths[i]))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut lines = vec![fmt_row(&HEADERS)];
    for row in rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        lines.push(fmt_row(&cells));
    }

    lines.join("\n") + "\n"
}
