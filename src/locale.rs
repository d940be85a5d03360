//! Localization CSV handling and the locale overlay.
//!
//! The CSV dialect is the usual one: comma-separated, fields quoted when
//! they contain a comma, quote, or newline, embedded quotes doubled. The
//! overlay is a string table parallel to the story pool; an empty entry
//! means "no translation, use the original".

use crate::story::Story;
use std::collections::HashMap;

/// Split one CSV line into fields, honoring quoting and doubled quotes.
pub fn parse_csv_line(line: &str) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '"' {
            if in_quotes && chars.get(i + 1) == Some(&'"') {
                cur.push('"');
                i += 1;
            } else {
                in_quotes = !in_quotes;
            }
        } else if c == ',' && !in_quotes {
            fields.push(std::mem::take(&mut cur));
        } else {
            cur.push(c);
        }
        i += 1;
    }
    fields.push(cur);
    fields
}

/// Render one CSV field, quoting only when needed.
pub fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Build a locale overlay from CSV text. Rows whose `line_id` matches one of
/// the story's line ids replace lookups at that pool index; everything else
/// is silently ignored. The translated text is the fifth column.
pub fn build_overlay(story: &Story, csv: &str) -> Vec<String> {
    let mut id_map: HashMap<&str, usize> = HashMap::new();
    for (i, id) in story.line_ids.iter().enumerate() {
        if !id.is_empty() {
            id_map.insert(id.as_str(), i);
        }
    }

    let mut overlay = vec![String::new(); story.string_pool.len()];
    for (row, line) in csv.lines().enumerate() {
        if row == 0 || line.is_empty() {
            // Header row, or blank.
            continue;
        }
        let line = line.strip_suffix('\r').unwrap_or(line);
        let cols = parse_csv_line(line);
        if cols.len() < 5 {
            continue;
        }
        if let Some(&idx) = id_map.get(cols[0].as_str()) {
            overlay[idx] = cols[4].clone();
        }
    }
    overlay
}
