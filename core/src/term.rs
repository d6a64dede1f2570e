//! Screen-state model wrapping [`alacritty_terminal`].
//!
//! [`Screen`] bundles a [`Term`] and the VTE [`Processor`] behind a simple
//! `process(bytes)` / `resize(rows, cols)` interface, and serializes the grid
//! to ANSI bytes for late-joiner snapshots. Scrollback history is kept at
//! zero here; the session ring buffer carries history, the screen only has
//! to reproduce what is currently visible.

use alacritty_terminal::event::EventListener;
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::index::{Column, Line, Point};
use alacritty_terminal::term::cell::{Cell, Flags};
use alacritty_terminal::term::{Config, Term};
use alacritty_terminal::vte::ansi::{Color, NamedColor, Processor};

/// Minimal [`Dimensions`] implementor for constructing and resizing a [`Term`].
#[derive(Debug, Clone, Copy)]
struct TermSize {
    columns: usize,
    screen_lines: usize,
}

impl Dimensions for TermSize {
    fn columns(&self) -> usize {
        self.columns
    }

    fn screen_lines(&self) -> usize {
        self.screen_lines
    }

    fn total_lines(&self) -> usize {
        self.screen_lines
    }
}

/// Terminal events (title, bell) are not surfaced to browsers; drop them.
#[derive(Debug, Clone, Copy)]
struct NoopListener;

impl EventListener for NoopListener {
    fn send_event(&self, _event: alacritty_terminal::event::Event) {}
}

/// Virtual terminal fed with every byte the PTY produces.
pub struct Screen {
    term: Term<NoopListener>,
    processor: Processor,
    rows: u16,
    cols: u16,
}

impl std::fmt::Debug for Screen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Screen")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish_non_exhaustive()
    }
}

impl Screen {
    pub fn new(rows: u16, cols: u16) -> Self {
        let rows = rows.max(1);
        let cols = cols.max(1);
        let size = TermSize {
            columns: cols as usize,
            screen_lines: rows as usize,
        };
        let config = Config {
            scrolling_history: 0,
            ..Config::default()
        };
        let term = Term::new(config, &size, NoopListener);
        Self {
            term,
            processor: Processor::new(),
            rows,
            cols,
        }
    }

    /// Feed raw PTY bytes. Hot path, called for every chunk the pump reads.
    pub fn process(&mut self, data: &[u8]) {
        self.processor.advance(&mut self.term, data);
    }

    pub fn resize(&mut self, rows: u16, cols: u16) {
        let rows = rows.max(1);
        let cols = cols.max(1);
        self.rows = rows;
        self.cols = cols;
        self.term.resize(TermSize {
            columns: cols as usize,
            screen_lines: rows as usize,
        });
    }

    pub fn size(&self) -> (u16, u16) {
        (self.rows, self.cols)
    }

    /// ANSI byte sequence that redraws the current screen on a fresh emulator:
    /// clear + home, then every cell with SGR transitions emitted only when
    /// attributes change from the previous cell, then a reset and a cursor
    /// move to the live position.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.rows as usize * self.cols as usize);
        out.extend_from_slice(b"\x1b[2J\x1b[H");

        let grid = self.term.grid();
        let cols = grid.columns();
        let lines = grid.screen_lines();
        let mut char_buf = [0u8; 4];
        // Tracks the receiving terminal's active SGR state across the whole
        // walk; rows do not reset it implicitly.
        let mut sgr = SgrState::reset();

        for row in 0..lines {
            if row > 0 {
                out.extend_from_slice(b"\r\n");
            }
            for col in 0..cols {
                let cell = &grid[Point::new(Line(row as i32), Column(col))];
                if cell.flags.contains(Flags::WIDE_CHAR_SPACER) {
                    continue;
                }
                let next = SgrState::from_cell(cell);
                if next != sgr {
                    next.emit(&mut out);
                    sgr = next;
                }
                let ch = if cell.c == '\0' { ' ' } else { cell.c };
                out.extend_from_slice(ch.encode_utf8(&mut char_buf).as_bytes());
                if let Some(zerowidth) = cell.zerowidth() {
                    for &zw in zerowidth {
                        out.extend_from_slice(zw.encode_utf8(&mut char_buf).as_bytes());
                    }
                }
            }
        }

        out.extend_from_slice(b"\x1b[0m");
        let cursor = grid.cursor.point;
        let row = cursor.line.0.max(0) as usize + 1;
        let col = cursor.column.0 + 1;
        out.extend_from_slice(format!("\x1b[{row};{col}H").as_bytes());
        out
    }

    /// Plain-text viewport contents, one line per row. Test helper.
    #[cfg(test)]
    pub fn contents(&self) -> String {
        let grid = self.term.grid();
        let mut out = String::new();
        for row in 0..grid.screen_lines() {
            if row > 0 {
                out.push('\n');
            }
            for col in 0..grid.columns() {
                out.push(grid[Point::new(Line(row as i32), Column(col))].c);
            }
        }
        out
    }

    /// Zero-based cursor position (row, col). Test helper.
    #[cfg(test)]
    pub fn cursor(&self) -> (usize, usize) {
        let p = self.term.grid().cursor.point;
        (p.line.0.max(0) as usize, p.column.0)
    }
}

/// Visual attributes of one cell; diffed against the previous cell so the
/// snapshot only emits escape sequences at attribute boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SgrState {
    fg: Color,
    bg: Color,
    flags: Flags,
}

impl SgrState {
    fn reset() -> Self {
        Self {
            fg: Color::Named(NamedColor::Foreground),
            bg: Color::Named(NamedColor::Background),
            flags: Flags::empty(),
        }
    }

    fn from_cell(cell: &Cell) -> Self {
        const VISUAL_FLAGS: Flags = Flags::BOLD
            .union(Flags::ITALIC)
            .union(Flags::UNDERLINE)
            .union(Flags::DIM)
            .union(Flags::INVERSE)
            .union(Flags::STRIKEOUT);
        Self {
            fg: cell.fg,
            bg: cell.bg,
            flags: cell.flags.intersection(VISUAL_FLAGS),
        }
    }

    /// Full reset followed by re-applying this state. Incremental attribute
    /// removal is terminal-dependent; reset + replay is universally correct.
    fn emit(self, out: &mut Vec<u8>) {
        out.extend_from_slice(b"\x1b[0");
        if self.flags.contains(Flags::BOLD) {
            out.extend_from_slice(b";1");
        }
        if self.flags.contains(Flags::DIM) {
            out.extend_from_slice(b";2");
        }
        if self.flags.contains(Flags::ITALIC) {
            out.extend_from_slice(b";3");
        }
        if self.flags.contains(Flags::UNDERLINE) {
            out.extend_from_slice(b";4");
        }
        if self.flags.contains(Flags::INVERSE) {
            out.extend_from_slice(b";7");
        }
        if self.flags.contains(Flags::STRIKEOUT) {
            out.extend_from_slice(b";9");
        }
        match self.fg {
            Color::Named(name) => {
                if let Some(idx) = named_palette_index(name) {
                    out.extend_from_slice(format!(";38;5;{idx}").as_bytes());
                }
            }
            Color::Indexed(idx) => out.extend_from_slice(format!(";38;5;{idx}").as_bytes()),
            Color::Spec(rgb) => out.extend_from_slice(
                format!(";38;2;{};{};{}", rgb.r, rgb.g, rgb.b).as_bytes(),
            ),
        }
        match self.bg {
            Color::Named(name) => {
                if let Some(idx) = named_palette_index(name) {
                    out.extend_from_slice(format!(";48;5;{idx}").as_bytes());
                }
            }
            Color::Indexed(idx) => out.extend_from_slice(format!(";48;5;{idx}").as_bytes()),
            Color::Spec(rgb) => out.extend_from_slice(
                format!(";48;2;{};{};{}", rgb.r, rgb.g, rgb.b).as_bytes(),
            ),
        }
        out.push(b'm');
    }
}

/// 256-color palette index for a named color; `None` for the defaults, which
/// the preceding reset already restored.
fn named_palette_index(color: NamedColor) -> Option<u8> {
    match color {
        NamedColor::Black | NamedColor::DimBlack => Some(0),
        NamedColor::Red | NamedColor::DimRed => Some(1),
        NamedColor::Green | NamedColor::DimGreen => Some(2),
        NamedColor::Yellow | NamedColor::DimYellow => Some(3),
        NamedColor::Blue | NamedColor::DimBlue => Some(4),
        NamedColor::Magenta | NamedColor::DimMagenta => Some(5),
        NamedColor::Cyan | NamedColor::DimCyan => Some(6),
        NamedColor::White | NamedColor::DimWhite => Some(7),
        NamedColor::BrightBlack => Some(8),
        NamedColor::BrightRed => Some(9),
        NamedColor::BrightGreen => Some(10),
        NamedColor::BrightYellow => Some(11),
        NamedColor::BrightBlue => Some(12),
        NamedColor::BrightMagenta => Some(13),
        NamedColor::BrightCyan => Some(14),
        NamedColor::BrightWhite => Some(15),
        NamedColor::Foreground
        | NamedColor::Background
        | NamedColor::Cursor
        | NamedColor::BrightForeground
        | NamedColor::DimForeground => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_basic_text() {
        let mut s = Screen::new(24, 80);
        s.process(b"hello\r\n");
        assert!(s.contents().starts_with("hello"));
        assert_eq!(s.cursor(), (1, 0));
    }

    #[test]
    fn resize_updates_dimensions() {
        let mut s = Screen::new(24, 80);
        s.resize(30, 100);
        assert_eq!(s.size(), (30, 100));
    }

    #[test]
    fn zero_size_clamped() {
        let s = Screen::new(0, 0);
        assert_eq!(s.size(), (1, 1));
    }

    #[test]
    fn snapshot_starts_with_clear_and_ends_with_cursor_move() {
        let mut s = Screen::new(24, 80);
        s.process(b"hello\r\n");
        let snap = s.snapshot();
        assert!(snap.starts_with(b"\x1b[2J\x1b[H"));
        let tail = String::from_utf8_lossy(&snap[snap.len().saturating_sub(16)..]).into_owned();
        assert!(tail.contains("[2;1H"), "tail: {tail:?}");
    }

    #[test]
    fn snapshot_replays_into_equivalent_screen() {
        let mut src = Screen::new(10, 40);
        src.process(b"one\r\n\x1b[31mred text\x1b[0m\r\nthree");
        let snap = src.snapshot();

        let mut dst = Screen::new(10, 40);
        dst.process(&snap);
        assert_eq!(src.contents(), dst.contents());
        assert_eq!(src.cursor(), dst.cursor());
    }

    #[test]
    fn snapshot_emits_color_transitions_once_per_run() {
        let mut s = Screen::new(2, 20);
        s.process(b"\x1b[38;5;10mgreen\x1b[0m plain");
        let snap = String::from_utf8_lossy(&s.snapshot()).into_owned();
        // One transition into color 10 for the run, not one per cell.
        assert_eq!(snap.matches(";38;5;10").count(), 1, "snapshot: {snap:?}");
    }
}
