//! Attribute state and the display buffer
//!
//! The display buffer is line oriented rather than a fixed cell grid: output
//! is mostly appended, and cursor positioning sequences only seek within (or
//! just past) the existing lines for targeted overwrites.

use std::collections::VecDeque;

use bitflags::bitflags;
use unicode_width::UnicodeWidthChar;

/// Tab stop interval
const TAB_WIDTH: usize = 8;

/// Terminal color
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Color {
    /// 0-7 standard, 8-15 bright, 16-255 extended palette
    Indexed(u8),
    Rgb(u8, u8, u8),
}

const COLOR_NAMES: [&str; 8] = [
    "black", "red", "green", "yellow", "blue", "magenta", "cyan", "white",
];

impl Color {
    /// Tag name used by consumers for styling, e.g. `red`, `bright_blue`.
    pub fn name(&self) -> String {
        match *self {
            Color::Indexed(n) if n < 8 => COLOR_NAMES[n as usize].to_string(),
            Color::Indexed(n) if n < 16 => format!("bright_{}", COLOR_NAMES[(n - 8) as usize]),
            Color::Indexed(n) => format!("color_{}", n),
            Color::Rgb(r, g, b) => format!("#{:02x}{:02x}{:02x}", r, g, b),
        }
    }
}

bitflags! {
    /// Composable style attributes
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct StyleFlags: u8 {
        const BOLD      = 0b0000_0001;
        const DIM       = 0b0000_0010;
        const UNDERLINE = 0b0000_0100;
        const BLINK     = 0b0000_1000;
        const REVERSE   = 0b0001_0000;
        const HIDDEN    = 0b0010_0000;
    }
}

const STYLE_NAMES: [(StyleFlags, &str); 6] = [
    (StyleFlags::BOLD, "bold"),
    (StyleFlags::DIM, "dim"),
    (StyleFlags::UNDERLINE, "underline"),
    (StyleFlags::BLINK, "blink"),
    (StyleFlags::REVERSE, "reverse"),
    (StyleFlags::HIDDEN, "hidden"),
];

/// The active attribute set.
///
/// At most one foreground and one background color; style flags compose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AttrSet {
    pub fg: Option<Color>,
    pub bg: Option<Color>,
    pub flags: StyleFlags,
}

impl AttrSet {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.fg.is_none() && self.bg.is_none() && self.flags.is_empty()
    }

    /// Named tags in a stable order: styles, foreground, `bg_` background.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = STYLE_NAMES
            .iter()
            .filter(|(flag, _)| self.flags.contains(*flag))
            .map(|(_, name)| name.to_string())
            .collect();
        if let Some(fg) = self.fg {
            tags.push(fg.name());
        }
        if let Some(bg) = self.bg {
            tags.push(format!("bg_{}", bg.name()));
        }
        tags
    }
}

/// A piece of text and the attributes it was printed with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StyledRun {
    pub text: String,
    pub attrs: AttrSet,
}

impl StyledRun {
    pub fn new(text: impl Into<String>, attrs: AttrSet) -> Self {
        Self {
            text: text.into(),
            attrs,
        }
    }

    /// Merge adjacent runs that share attributes.
    pub fn coalesce(runs: impl IntoIterator<Item = StyledRun>) -> Vec<StyledRun> {
        let mut merged: Vec<StyledRun> = Vec::new();
        for run in runs {
            if run.text.is_empty() {
                continue;
            }
            match merged.last_mut() {
                Some(last) if last.attrs == run.attrs => last.text.push_str(&run.text),
                _ => merged.push(run),
            }
        }
        merged
    }
}

/// One cell of a buffer line
#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    pub ch: char,
    /// Zero-width characters attached to `ch`
    pub combining: Vec<char>,
    pub attrs: AttrSet,
    /// Right half of a wide character
    pub continuation: bool,
}

impl Cell {
    fn blank() -> Self {
        Self {
            ch: ' ',
            combining: Vec::new(),
            attrs: AttrSet::default(),
            continuation: false,
        }
    }

    fn new(ch: char, attrs: AttrSet) -> Self {
        Self {
            ch,
            combining: Vec::new(),
            attrs,
            continuation: false,
        }
    }

    fn push_to(&self, out: &mut String) {
        if self.continuation {
            return;
        }
        out.push(self.ch);
        out.extend(self.combining.iter());
    }
}

/// Logical insertion cursor (0-based)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cursor {
    pub row: usize,
    pub col: usize,
}

/// Styled text buffer fed by the interpreter.
pub struct DisplayBuffer {
    lines: VecDeque<Vec<Cell>>,
    cursor: Cursor,
    /// Oldest lines are dropped beyond this count (0 = unlimited)
    max_lines: usize,
}

impl Default for DisplayBuffer {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DisplayBuffer {
    pub fn new(max_lines: usize) -> Self {
        let mut lines = VecDeque::new();
        lines.push_back(Vec::new());
        Self {
            lines,
            cursor: Cursor::default(),
            max_lines,
        }
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Plain text of one line.
    pub fn line_text(&self, row: usize) -> Option<String> {
        let line = self.lines.get(row)?;
        let mut out = String::with_capacity(line.len());
        for cell in line {
            cell.push_to(&mut out);
        }
        Some(out)
    }

    /// Styled runs of one line, adjacent equal attributes merged.
    pub fn line_runs(&self, row: usize) -> Vec<StyledRun> {
        let Some(line) = self.lines.get(row) else {
            return Vec::new();
        };
        StyledRun::coalesce(line.iter().filter(|c| !c.continuation).map(|cell| {
            let mut text = String::new();
            cell.push_to(&mut text);
            StyledRun::new(text, cell.attrs)
        }))
    }

    /// Whole buffer as plain text, lines joined with `\n`.
    pub fn text(&self) -> String {
        (0..self.lines.len())
            .filter_map(|row| self.line_text(row))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Write text at the cursor, interpreting `\n`, `\r`, `\t` and backspace.
    pub fn write_text(&mut self, text: &str, attrs: AttrSet) {
        for ch in text.chars() {
            match ch {
                '\n' => self.newline(),
                '\r' => self.cursor.col = 0,
                '\x08' => self.cursor.col = self.cursor.col.saturating_sub(1),
                '\t' => {
                    let next = (self.cursor.col / TAB_WIDTH + 1) * TAB_WIDTH;
                    self.pad_to(self.cursor.row, next);
                    self.cursor.col = next;
                }
                c if c.is_control() => {}
                c => self.put_char(c, attrs),
            }
        }
    }

    /// Move the cursor; `row: None` keeps the current row.
    ///
    /// Rows past the end of the buffer are created empty.
    pub fn move_to(&mut self, row: Option<usize>, col: usize) {
        if let Some(row) = row {
            while self.lines.len() <= row {
                self.lines.push_back(Vec::new());
            }
            self.cursor.row = row;
            self.trim_to_limit();
        }
        self.cursor.col = col;
    }

    /// Erase in line: 0 = cursor to end, 1 = start to cursor, 2 = whole line.
    pub fn erase_line(&mut self, mode: u16) {
        let col = self.cursor.col;
        let Some(line) = self.lines.get_mut(self.cursor.row) else {
            return;
        };
        match mode {
            0 => line.truncate(col),
            1 => {
                let end = (col + 1).min(line.len());
                for cell in &mut line[..end] {
                    *cell = Cell::blank();
                }
            }
            2 => line.clear(),
            _ => {}
        }
    }

    /// Erase in display: 0 = cursor to end, 1 = start to cursor, 2/3 = all.
    pub fn erase_display(&mut self, mode: u16) {
        match mode {
            0 => {
                self.erase_line(0);
                self.lines.truncate(self.cursor.row + 1);
            }
            1 => {
                for row in 0..self.cursor.row.min(self.lines.len()) {
                    self.lines[row].clear();
                }
                self.erase_line(1);
            }
            2 | 3 => self.clear(),
            _ => {}
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.lines.push_back(Vec::new());
        self.cursor = Cursor::default();
    }

    fn newline(&mut self) {
        self.cursor.row += 1;
        self.cursor.col = 0;
        while self.lines.len() <= self.cursor.row {
            self.lines.push_back(Vec::new());
        }
        self.trim_to_limit();
    }

    fn trim_to_limit(&mut self) {
        if self.max_lines == 0 {
            return;
        }
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            self.cursor.row = self.cursor.row.saturating_sub(1);
        }
    }

    fn pad_to(&mut self, row: usize, len: usize) {
        if let Some(line) = self.lines.get_mut(row) {
            while line.len() < len {
                line.push(Cell::blank());
            }
        }
    }

    fn put_char(&mut self, ch: char, attrs: AttrSet) {
        let width = ch.width().unwrap_or(0);
        let Cursor { row, col } = self.cursor;

        if width == 0 {
            // Combining mark: attach to the previous printed cell
            if let Some(line) = self.lines.get_mut(row) {
                let end = col.min(line.len());
                let prev = line[..end]
                    .iter_mut()
                    .rev()
                    .find(|c| !c.continuation);
                if let Some(cell) = prev {
                    cell.combining.push(ch);
                }
            }
            return;
        }

        self.pad_to(row, col + width);
        let Some(line) = self.lines.get_mut(row) else {
            return;
        };

        // Overwriting half of a wide character blanks the other half
        if line[col].continuation && col > 0 {
            line[col - 1] = Cell::blank();
        }
        let end = col + width;
        if end < line.len() && line[end].continuation {
            line[end] = Cell::blank();
        }

        line[col] = Cell::new(ch, attrs);
        if width == 2 {
            line[col + 1] = Cell {
                continuation: true,
                ..Cell::new(' ', attrs)
            };
        }
        self.cursor.col = end;
    }
}
