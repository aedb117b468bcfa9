//! Screen data model: cells, attributes, snapshots, and deltas.
//!
//! A snapshot captures the whole grid once at attach time; deltas carry
//! contiguous row ranges that changed since the last emission. Both are
//! built server-side from the emulator and shipped in the binary wire
//! encoding.

use serde::{Deserialize, Serialize};

/// Text style bitmask.
///
/// The bit values are part of the wire contract. Decoders keep unknown
/// bits as-is rather than rejecting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Style(pub u8);

impl Style {
    pub const BOLD: Style = Style(1);
    pub const UNDERLINE: Style = Style(1 << 1);
    pub const BLINK: Style = Style(1 << 2);
    pub const INVERT: Style = Style(1 << 3);
    pub const INVISIBLE: Style = Style(1 << 4);
    pub const DIM: Style = Style(1 << 5);
    pub const ITALIC: Style = Style(1 << 6);
    pub const CROSSED_OUT: Style = Style(1 << 7);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Style) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Style {
    type Output = Style;

    fn bitor(self, rhs: Style) -> Style {
        Style(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Style {
    fn bitor_assign(&mut self, rhs: Style) {
        self.0 |= rhs.0;
    }
}

/// A terminal color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Color {
    #[default]
    Default,
    DefaultInverted,
    Ansi { index: u8 },
    TrueColor { r: u8, g: u8, b: u8 },
}

/// Visual attributes of one cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub fg: Color,
    pub bg: Color,
    pub style: Style,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub underline_color: Option<Color>,
}

/// One screen position: a grapheme, its east-asian width in columns
/// (0, 1, or 2), and its attribute.
///
/// A width-2 cell is always followed by one width-0 companion cell so
/// that widths along a row sum to the column count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    #[serde(rename = "char")]
    pub ch: String,
    pub width: i8,
    pub attr: Attribute,
}

impl Cell {
    /// A plain space with default attributes, used for padding.
    pub fn blank() -> Self {
        Self {
            ch: " ".to_string(),
            width: 1,
            attr: Attribute::default(),
        }
    }
}

/// Full-screen capture sent once when a subscriber attaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenSnapshot {
    pub cols: u16,
    pub rows: u16,
    pub cursor_x: u16,
    pub cursor_y: u16,
    pub is_alternate: bool,
    pub lines: Vec<Vec<Cell>>,
}

/// A contiguous range of rows `[start_y, end_y]` (inclusive) that
/// changed since the last emission, plus the current cursor position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenDelta {
    pub start_y: u16,
    pub end_y: u16,
    pub cursor_x: u16,
    pub cursor_y: u16,
    pub lines: Vec<Vec<Cell>>,
}

/// Concatenated cell characters of one row, for display and tests.
pub fn line_text(cells: &[Cell]) -> String {
    cells.iter().map(|c| c.ch.as_str()).collect()
}
