//! One-based line/column resolution against file contents.
//!
//! The tool protocol addresses lines either by one-based number or by
//! substring (first matching line wins, earliest line on ties by
//! construction). Columns at this boundary are one-based; everything below
//! works in zero-based lines and UTF-16 columns.

use lsp_types::Position;

use crate::error::{BrokerError, Result};
use crate::tools::args::LineSelector;

/// Resolve a line selector to a zero-based line index.
pub fn resolve_line(text: &str, selector: &LineSelector, file_label: &str) -> Result<u32> {
    match selector {
        LineSelector::Number(n) => {
            let count = text.lines().count().max(1);
            if *n == 0 || *n as usize > count {
                return Err(BrokerError::InvalidArgument(format!(
                    "line {n} out of range for {file_label} ({count} lines)"
                )));
            }
            Ok(n - 1)
        }
        LineSelector::Substring(needle) => text
            .lines()
            .position(|line| line.contains(needle.as_str()))
            .map(|index| index as u32)
            .ok_or_else(|| BrokerError::LineNotFound {
                file: file_label.to_string(),
                needle: needle.clone(),
            }),
    }
}

/// UTF-16 column of the first occurrence of `symbol` on the given line.
pub fn find_symbol_column(
    text: &str,
    line: u32,
    symbol: &str,
    file_label: &str,
) -> Result<u32> {
    let line_text = text.lines().nth(line as usize).unwrap_or_default();
    match line_text.find(symbol) {
        Some(byte_index) => Ok(utf16_len(&line_text[..byte_index])),
        None => Err(BrokerError::SymbolNotFoundOnLine {
            symbol: symbol.to_string(),
            line: line + 1,
            file: file_label.to_string(),
        }),
    }
}

/// Zero-based LSP position from a line selector plus either a symbol target
/// or a one-based column. With neither, the line start is used.
pub fn position_for(
    text: &str,
    selector: &LineSelector,
    character: Option<u32>,
    target: Option<&str>,
    file_label: &str,
) -> Result<Position> {
    let line = resolve_line(text, selector, file_label)?;
    let character = match (target, character) {
        (Some(symbol), _) => find_symbol_column(text, line, symbol, file_label)?,
        (None, Some(column)) => {
            if column == 0 {
                return Err(BrokerError::InvalidArgument(
                    "character is one-based; 0 is not a column".into(),
                ));
            }
            column - 1
        }
        (None, None) => 0,
    };
    Ok(Position { line, character })
}

pub fn utf16_len(text: &str) -> u32 {
    text.chars().map(|c| c.len_utf16() as u32).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "import {greet} from './a';\ngreet('w');\ngreet('x');\n";

    #[test]
    fn line_number_is_one_based() {
        assert_eq!(
            resolve_line(SOURCE, &LineSelector::Number(2), "b.ts").unwrap(),
            1
        );
        assert!(resolve_line(SOURCE, &LineSelector::Number(0), "b.ts").is_err());
        assert!(resolve_line(SOURCE, &LineSelector::Number(99), "b.ts").is_err());
    }

    #[test]
    fn substring_picks_first_matching_line() {
        // "greet" appears on every line; the first one wins
        assert_eq!(
            resolve_line(SOURCE, &LineSelector::Substring("greet".into()), "b.ts").unwrap(),
            0
        );
        assert_eq!(
            resolve_line(SOURCE, &LineSelector::Substring("('x')".into()), "b.ts").unwrap(),
            2
        );
        let missing = resolve_line(SOURCE, &LineSelector::Substring("nope".into()), "b.ts");
        assert!(matches!(missing, Err(BrokerError::LineNotFound { .. })));
    }

    #[test]
    fn symbol_column_is_utf16_aware() {
        let text = "let 𝑥 = greet();\n";
        // "let " is 4 units, 𝑥 is 2, " = " is 3
        assert_eq!(find_symbol_column(text, 0, "greet", "a.ts").unwrap(), 9);
        let missing = find_symbol_column(text, 0, "absent", "a.ts");
        assert!(matches!(
            missing,
            Err(BrokerError::SymbolNotFoundOnLine { line: 1, .. })
        ));
    }

    #[test]
    fn position_prefers_target_over_character() {
        let position = position_for(
            SOURCE,
            &LineSelector::Number(2),
            Some(3),
            Some("greet"),
            "b.ts",
        )
        .unwrap();
        assert_eq!(position, Position::new(1, 0));

        let by_character =
            position_for(SOURCE, &LineSelector::Number(2), Some(3), None, "b.ts").unwrap();
        assert_eq!(by_character, Position::new(1, 2));
    }
}
