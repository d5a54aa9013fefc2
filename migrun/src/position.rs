//! Translating engine-reported error positions into line and column.
//!
//! PostgreSQL reports the location of a syntax error as a 1-based offset
//! into the query text, counted in characters rather than bytes. Carriage
//! returns are treated as zero-width so that a script checked out with CRLF
//! line endings reports the same location as its LF twin.

/// A 1-based line and column in a migration script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

/// Map the 1-based character offset `pos` in `text` to a [`Position`].
///
/// Returns `None` when `pos` is zero or past the end of the text. An offset
/// that lands on a line feed reports the following line with column 0.
pub fn map_position(text: &str, pos: usize) -> Option<Position> {
    if pos == 0 {
        return None;
    }

    let mut index = 0;
    let mut line = 1;
    let mut line_start = 0;
    for ch in text.chars() {
        if ch == '\r' {
            continue;
        }
        index += 1;
        if ch == '\n' {
            line += 1;
            line_start = index;
        }
        if index == pos {
            return Some(Position {
                line,
                column: index - line_start,
            });
        }
    }
    None
}

/// Number of characters in `text` as counted by [`map_position`].
pub(crate) fn logical_len(text: &str) -> usize {
    text.chars().filter(|&ch| ch != '\r').count()
}

/// The [`Position`] of the character starting at byte `offset` of `text`.
///
/// A carriage return reports the position of the character after it.
pub fn position_at_byte(text: &str, offset: usize) -> Option<Position> {
    let before = text.get(..offset)?;
    map_position(text, logical_len(before) + 1)
}
