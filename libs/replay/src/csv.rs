//! Line-oriented CSV: header-mapped reader for traces, row writer for reports.

use crate::error::ReplayError;

pub(crate) const DELIMITER: char = ',';

// ═══════════════════════════════════════════════════════════════
//  Column mapping
// ═══════════════════════════════════════════════════════════════

pub(crate) struct ColumnMap {
    names: Vec<String>,
}

impl ColumnMap {
    /// Определить маппинг из строки заголовка.
    pub fn from_header(fields: &[String]) -> Self {
        let names: Vec<String> = fields
            .iter()
            .map(|f| f.trim().trim_start_matches('\u{feff}').to_string())
            .collect();
        Self { names }
    }

    /// Индекс обязательной колонки.
    pub fn require(&self, name: &str) -> Result<usize, ReplayError> {
        self.names.iter().position(|n| n == name).ok_or_else(|| {
            ReplayError::trace(format!(
                "missing column '{name}' (header: {})",
                self.names.join(", ")
            ))
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Record splitter
// ═══════════════════════════════════════════════════════════════

/// Разбить текст на записи. Перевод строки внутри кавычек не завершает
/// запись. Возвращает номер первой строки записи (1-based) и её текст
/// без завершающего `\r`.
pub(crate) fn records(content: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    let mut start_line = 1;
    let mut line = 1;

    // '"' и '\n' однобайтовые в UTF-8, поэтому байтовые индексы безопасны.
    for (i, b) in content.bytes().enumerate() {
        match b {
            b'"' => quoted = !quoted,
            b'\n' => {
                line += 1;
                if !quoted {
                    out.push((start_line, content[start..i].trim_end_matches('\r')));
                    start = i + 1;
                    start_line = line;
                }
            }
            _ => {}
        }
    }
    if start < content.len() {
        out.push((start_line, content[start..].trim_end_matches('\r')));
    }
    out
}

// ═══════════════════════════════════════════════════════════════
//  RFC 4180 field parser
// ═══════════════════════════════════════════════════════════════

/// Разбирает одну RFC 4180 строку на поля с учётом quoting.
pub(crate) fn parse_fields(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();
    let mut field = String::new();

    loop {
        if chars.peek() == Some(&'"') {
            chars.next(); // opening quote
            loop {
                match chars.next() {
                    Some('"') => {
                        if chars.peek() == Some(&'"') {
                            // Escaped quote: "" → "
                            chars.next();
                            field.push('"');
                        } else {
                            break;
                        }
                    }
                    Some(c) => field.push(c),
                    None => break, // EOF inside quote: best effort
                }
            }
            // Skip trailing chars after closing quote
            loop {
                match chars.next() {
                    Some(c) if c == delimiter => break,
                    Some(_) => {}
                    None => break,
                }
            }
        } else {
            loop {
                match chars.next() {
                    Some(c) if c == delimiter => break,
                    Some(c) => field.push(c),
                    None => break,
                }
            }
        }

        fields.push(std::mem::take(&mut field));

        if chars.peek().is_none() {
            if line.ends_with(delimiter) {
                // Trailing delimiter → one more empty field
                fields.push(String::new());
            }
            break;
        }
    }

    fields
}

// ═══════════════════════════════════════════════════════════════
//  Row serializer
// ═══════════════════════════════════════════════════════════════

/// Сериализовать строку отчёта. `None` → пустая ячейка.
pub(crate) fn format_row<S: AsRef<str>>(cells: &[Option<S>]) -> String {
    let mut result = String::new();
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            result.push(DELIMITER);
        }
        if let Some(s) = cell {
            let s = s.as_ref();
            if s.contains(DELIMITER) || s.contains('"') || s.contains('\n') || s.contains('\r') {
                result.push('"');
                result.push_str(&s.replace('"', "\"\""));
                result.push('"');
            } else {
                result.push_str(s);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_quoted_fields() {
        assert_eq!(parse_fields("a,b,c", ','), vec!["a", "b", "c"]);
        assert_eq!(
            parse_fields(r#""2023-11-16 18:15:46",374,"say ""hi"", ok""#, ','),
            vec!["2023-11-16 18:15:46", "374", r#"say "hi", ok"#]
        );
    }

    #[test]
    fn keeps_empty_and_trailing_fields() {
        assert_eq!(parse_fields("a,,c", ','), vec!["a", "", "c"]);
        assert_eq!(parse_fields("a,b,", ','), vec!["a", "b", ""]);
    }

    #[test]
    fn records_keep_quoted_newlines_together() {
        let text = "a,b\r\n1,\"multi\nline\"\n\n2,\"say \"\"x\"\"\"\n3,last";
        let recs = records(text);
        assert_eq!(
            recs,
            vec![
                (1, "a,b"),
                (2, "1,\"multi\nline\""),
                (4, ""),
                (5, "2,\"say \"\"x\"\"\""),
                (6, "3,last"),
            ]
        );
        assert_eq!(parse_fields(recs[1].1, ','), vec!["1", "multi\nline"]);
    }

    #[test]
    fn header_lookup_reports_missing_column() {
        let map = ColumnMap::from_header(&parse_fields("\u{feff}TIMESTAMP, ContextTokens", ','));
        assert_eq!(map.require("TIMESTAMP").unwrap(), 0);
        assert_eq!(map.require("ContextTokens").unwrap(), 1);
        let err = map.require("GeneratedTokens").unwrap_err();
        assert!(err.to_string().contains("GeneratedTokens"), "{err}");
    }

    #[test]
    fn format_row_quotes_only_when_needed() {
        let row = format_row(&[Some("1.5"), None, Some("a,b"), Some("say \"x\"")]);
        assert_eq!(row, r#"1.5,,"a,b","say ""x""""#);
    }

    #[test]
    fn formatted_row_parses_back() {
        let cells = [Some("x"), Some("connect: refused, retry"), None];
        let line = format_row(&cells);
        assert_eq!(parse_fields(&line, ','), vec!["x", "connect: refused, retry", ""]);
    }
}
