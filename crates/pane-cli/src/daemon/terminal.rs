//! In-memory terminal screen model.
//!
//! The session core only depends on the [`Emulator`] trait; the
//! production implementation wraps `vt100::Parser` for ANSI parsing
//! and tracks a dirty row range by hashing row contents, since the
//! parser itself does not report damage.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use pane_core::screen::{Attribute, Cell, Color, Style};

use crate::daemon::pty::TermSize;

/// Screen state consumed by the session: feed bytes in, read cells
/// and an accumulated dirty row range out.
pub trait Emulator: Send {
    /// Parse a batch of PTY output.
    fn feed(&mut self, bytes: &[u8]);
    fn cols(&self) -> u16;
    fn rows(&self) -> u16;
    fn resize(&mut self, cols: u16, rows: u16);
    /// Cursor position as (x, y), zero-based.
    fn cursor(&self) -> (u16, u16);
    fn alternate_screen(&self) -> bool;
    /// Cell at (x, y), or `None` outside the grid. Width-0 companion
    /// cells of wide characters carry an empty character and the wide
    /// cell's attribute.
    fn cell(&self, x: u16, y: u16) -> Option<Cell>;
    /// Inclusive row range touched since the last [`Emulator::clear_dirty`].
    fn dirty_range(&self) -> Option<(u16, u16)>;
    fn clear_dirty(&mut self);
}

/// vt100-backed emulator.
pub struct TerminalEmulator {
    parser: vt100::Parser,
    row_hashes: Vec<u64>,
    dirty: Option<(u16, u16)>,
}

impl TerminalEmulator {
    pub fn new(size: TermSize) -> Self {
        let parser = vt100::Parser::new(size.rows, size.cols, 0);
        let row_hashes = (0..size.rows)
            .map(|y| hash_row(parser.screen(), y, size.cols))
            .collect();
        Self {
            parser,
            row_hashes,
            dirty: None,
        }
    }

    fn mark_dirty(&mut self, y: u16) {
        self.dirty = Some(match self.dirty {
            Some((start, end)) => (start.min(y), end.max(y)),
            None => (y, y),
        });
    }

    fn refresh_damage(&mut self) {
        let (rows, cols) = self.parser.screen().size();
        for y in 0..rows {
            let hash = hash_row(self.parser.screen(), y, cols);
            if self.row_hashes.get(y as usize).copied() != Some(hash) {
                if let Some(slot) = self.row_hashes.get_mut(y as usize) {
                    *slot = hash;
                }
                self.mark_dirty(y);
            }
        }
    }
}

impl Emulator for TerminalEmulator {
    fn feed(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
        self.refresh_damage();
    }

    fn cols(&self) -> u16 {
        self.parser.screen().size().1
    }

    fn rows(&self) -> u16 {
        self.parser.screen().size().0
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.set_size(rows, cols);
        self.row_hashes = (0..rows)
            .map(|y| hash_row(self.parser.screen(), y, cols))
            .collect();
        // Everything must be repainted at the new dimensions.
        self.dirty = if rows > 0 { Some((0, rows - 1)) } else { None };
    }

    fn cursor(&self) -> (u16, u16) {
        let (row, col) = self.parser.screen().cursor_position();
        (col, row)
    }

    fn alternate_screen(&self) -> bool {
        self.parser.screen().alternate_screen()
    }

    fn cell(&self, x: u16, y: u16) -> Option<Cell> {
        let cell = self.parser.screen().cell(y, x)?;
        let attr = Attribute {
            fg: map_color(cell.fgcolor()),
            bg: map_color(cell.bgcolor()),
            style: map_style(cell),
            underline_color: None,
        };
        if cell.is_wide_continuation() {
            return Some(Cell {
                ch: String::new(),
                width: 0,
                attr,
            });
        }
        let mut ch = cell.contents();
        if ch.is_empty() || ch == "\0" {
            ch = " ".to_string();
        }
        let width = if cell.is_wide() { 2 } else { 1 };
        Some(Cell { ch, width, attr })
    }

    fn dirty_range(&self) -> Option<(u16, u16)> {
        self.dirty
    }

    fn clear_dirty(&mut self) {
        self.dirty = None;
    }
}

fn map_color(color: vt100::Color) -> Color {
    match color {
        vt100::Color::Default => Color::Default,
        vt100::Color::Idx(index) => Color::Ansi { index },
        vt100::Color::Rgb(r, g, b) => Color::TrueColor { r, g, b },
    }
}

fn map_style(cell: &vt100::Cell) -> Style {
    let mut style = Style::default();
    if cell.bold() {
        style |= Style::BOLD;
    }
    if cell.italic() {
        style |= Style::ITALIC;
    }
    if cell.underline() {
        style |= Style::UNDERLINE;
    }
    if cell.inverse() {
        style |= Style::INVERT;
    }
    style
}

fn hash_color(color: vt100::Color, hasher: &mut DefaultHasher) {
    match color {
        vt100::Color::Default => 0u8.hash(hasher),
        vt100::Color::Idx(index) => (1u8, index).hash(hasher),
        vt100::Color::Rgb(r, g, b) => (2u8, r, g, b).hash(hasher),
    }
}

fn hash_row(screen: &vt100::Screen, y: u16, cols: u16) -> u64 {
    let mut hasher = DefaultHasher::new();
    for x in 0..cols {
        match screen.cell(y, x) {
            Some(cell) => {
                cell.contents().hash(&mut hasher);
                hash_color(cell.fgcolor(), &mut hasher);
                hash_color(cell.bgcolor(), &mut hasher);
                (
                    cell.bold(),
                    cell.italic(),
                    cell.underline(),
                    cell.inverse(),
                    cell.is_wide(),
                    cell.is_wide_continuation(),
                )
                    .hash(&mut hasher);
            }
            None => u8::MAX.hash(&mut hasher),
        }
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emulator() -> TerminalEmulator {
        TerminalEmulator::new(TermSize { cols: 80, rows: 24 })
    }

    #[test]
    fn feed_plain_text_dirties_one_row() {
        let mut term = emulator();
        term.clear_dirty();

        term.feed(b"Hello World");
        assert_eq!(term.dirty_range(), Some((0, 0)));
        assert_eq!(term.cursor(), (11, 0));
        assert_eq!(term.cell(0, 0).unwrap().ch, "H");
    }

    #[test]
    fn dirty_range_accumulates_until_cleared() {
        let mut term = emulator();
        term.clear_dirty();

        term.feed(b"top");
        term.feed(b"\x1b[5;1Hmiddle");
        assert_eq!(term.dirty_range(), Some((0, 4)));

        term.clear_dirty();
        assert_eq!(term.dirty_range(), None);

        term.feed(b"\x1b[3;1Hrow three");
        assert_eq!(term.dirty_range(), Some((2, 2)));
    }

    #[test]
    fn cursor_movement_alone_is_not_dirty() {
        let mut term = emulator();
        term.clear_dirty();

        term.feed(b"\x1b[10;10H");
        assert_eq!(term.dirty_range(), None);
        assert_eq!(term.cursor(), (9, 9));
    }

    #[test]
    fn resize_dirties_whole_screen() {
        let mut term = emulator();
        term.clear_dirty();

        term.resize(100, 30);
        assert_eq!(term.cols(), 100);
        assert_eq!(term.rows(), 30);
        assert_eq!(term.dirty_range(), Some((0, 29)));
    }

    #[test]
    fn blank_cells_render_as_spaces() {
        let term = emulator();
        let cell = term.cell(10, 5).expect("in bounds");
        assert_eq!(cell.ch, " ");
        assert_eq!(cell.width, 1);
        assert!(term.cell(80, 0).is_none());
        assert!(term.cell(0, 24).is_none());
    }

    #[test]
    fn wide_character_has_zero_width_companion() {
        let mut term = emulator();
        term.feed("漢".as_bytes());

        let wide = term.cell(0, 0).expect("wide cell");
        assert_eq!(wide.ch, "漢");
        assert_eq!(wide.width, 2);

        let companion = term.cell(1, 0).expect("companion cell");
        assert_eq!(companion.ch, "");
        assert_eq!(companion.width, 0);
        assert_eq!(companion.attr, wide.attr);
    }

    #[test]
    fn colors_and_styles_map_through() {
        let mut term = emulator();
        term.feed(b"\x1b[1;4;31;44mX\x1b[0m");

        let cell = term.cell(0, 0).unwrap();
        assert_eq!(cell.attr.fg, Color::Ansi { index: 1 });
        assert_eq!(cell.attr.bg, Color::Ansi { index: 4 });
        assert!(cell.attr.style.contains(Style::BOLD));
        assert!(cell.attr.style.contains(Style::UNDERLINE));
        assert!(!cell.attr.style.contains(Style::ITALIC));
    }

    #[test]
    fn true_color_maps_through() {
        let mut term = emulator();
        term.feed(b"\x1b[38;2;10;20;30mT\x1b[0m");
        let cell = term.cell(0, 0).unwrap();
        assert_eq!(
            cell.attr.fg,
            Color::TrueColor {
                r: 10,
                g: 20,
                b: 30
            }
        );
    }

    #[test]
    fn alternate_screen_flag_tracks_mode() {
        let mut term = emulator();
        assert!(!term.alternate_screen());
        term.feed(b"\x1b[?1049h");
        assert!(term.alternate_screen());
        term.feed(b"\x1b[?1049l");
        assert!(!term.alternate_screen());
    }

    #[test]
    fn attribute_only_change_is_dirty() {
        let mut term = emulator();
        term.feed(b"plain");
        term.clear_dirty();

        // Rewrite the same text in bold; contents match, style differs.
        term.feed(b"\x1b[1;1H\x1b[1mplain\x1b[0m");
        assert_eq!(term.dirty_range(), Some((0, 0)));
    }
}
