//! Minimal CSV primitives for exports and device-list import.
//!
//! Files are UTF-8 with a byte-order mark and a header row. Fields are flat
//! scalars; quoting is only applied when a field contains a comma, quote, or
//! newline.

/// UTF-8 byte-order mark written at the start of every exported file.
pub const BOM: &[u8] = b"\xef\xbb\xbf";

/// Escape a single field for CSV output.
pub fn escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Render one CSV row (no trailing newline).
pub fn format_row(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| escape(f))
        .collect::<Vec<_>>()
        .join(",")
}

/// Split one CSV line into fields, honoring double-quote escaping.
pub fn parse_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        cur.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => cur.push(c),
            }
        } else {
            match c {
                '"' => in_quotes = true,
                ',' => fields.push(std::mem::take(&mut cur)),
                _ => cur.push(c),
            }
        }
    }
    fields.push(cur);
    fields
}

/// Strip a leading BOM from file contents, if present.
pub fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_plain() {
        assert_eq!(escape("router-1"), "router-1");
        assert_eq!(escape("10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn test_escape_special() {
        assert_eq!(escape("rack 4, row 2"), "\"rack 4, row 2\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_parse_roundtrip() {
        let fields = vec![
            "10.0.0.1".to_string(),
            "core, uplink".to_string(),
            "owner \"net\"".to_string(),
        ];
        let line = format_row(&fields);
        assert_eq!(parse_line(&line), fields);
    }

    #[test]
    fn test_parse_empty_fields() {
        assert_eq!(parse_line("a,,c"), vec!["a", "", "c"]);
        assert_eq!(parse_line(""), vec![""]);
    }

    #[test]
    fn test_strip_bom() {
        assert_eq!(strip_bom("\u{feff}ip,name"), "ip,name");
        assert_eq!(strip_bom("ip,name"), "ip,name");
    }
}
