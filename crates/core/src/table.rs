use comfy_table::{presets::NOTHING, Table};

/// Borderless table with a leading row-index column; `name` titles that column.
pub fn render_with_name(name: &str, header: &[&str], rows: &[Vec<String>]) -> String {
    let mut table = Table::new();
    table.load_preset(NOTHING);
    if !header.is_empty() {
        let mut cells: Vec<String> = Vec::with_capacity(header.len() + 1);
        cells.push(name.to_string());
        cells.extend(header.iter().map(|h| h.to_string()));
        table.set_header(cells);
    }
    for (i, row) in rows.iter().enumerate() {
        let mut cells: Vec<String> = Vec::with_capacity(row.len() + 1);
        cells.push(i.to_string());
        cells.extend(row.iter().cloned());
        table.add_row(cells);
    }
    table.to_string()
}
