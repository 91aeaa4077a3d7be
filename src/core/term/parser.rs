//! ANSI escape sequence interpreter
//!
//! Splits decoded terminal output into styled text runs and buffer actions.
//! The tokenizer keeps its state between calls, so an escape sequence split
//! across two output chunks is handled the same as one delivered whole.

use tracing::debug;

use super::state::{AttrSet, Color, DisplayBuffer, StyleFlags, StyledRun};

/// Longest CSI parameter string we accumulate before giving up on a sequence
const MAX_CSI_LEN: usize = 64;

/// Longest OSC payload we accumulate
const MAX_OSC_LEN: usize = 4096;

/// DEC private modes we track but never render
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerminalModes {
    /// ?1: cursor keys send ESC O x
    pub application_cursor: bool,
    /// ?25
    pub cursor_visible: bool,
    /// ?1049 / ?1047 / ?47
    pub alternate_screen: bool,
    /// ?2004
    pub bracketed_paste: bool,
}

impl Default for TerminalModes {
    fn default() -> Self {
        Self {
            application_cursor: false,
            cursor_visible: true,
            alternate_screen: false,
            bracketed_paste: false,
        }
    }
}

impl TerminalModes {
    fn set(&mut self, mode: u16, enable: bool) {
        match mode {
            1 => self.application_cursor = enable,
            25 => self.cursor_visible = enable,
            47 | 1047 | 1049 => self.alternate_screen = enable,
            2004 => self.bracketed_paste = enable,
            _ => debug!("Ignoring private mode {} = {}", mode, enable),
        }
    }
}

/// Something the display buffer should do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Text tagged with the attributes active when it arrived
    Print(StyledRun),
    /// Absolute move, 0-based; `row: None` keeps the current row
    CursorTo { row: Option<usize>, col: usize },
    EraseDisplay(u16),
    EraseLine(u16),
    /// OSC 0/1/2 window title
    SetTitle(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ParserState {
    #[default]
    Ground,
    Escape,
    EscapeIntermediate,
    Csi,
    /// Oversized CSI, skipped up to its final byte
    CsiIgnore,
    OscString,
    /// ESC received within OSC, waiting for backslash
    EscapeInOsc,
}

/// Incremental ANSI interpreter.
///
/// One instance per terminal session; attributes persist across chunks
/// until an explicit reset.
pub struct AnsiInterpreter {
    state: ParserState,
    /// Raw parameter characters of the CSI in progress
    params: String,
    /// Private marker (`?`, `>`, `=`, `!`) of the CSI in progress
    private: Option<char>,
    intermediates: String,
    osc: String,
    /// Printable text waiting to be emitted
    text: String,
    attrs: AttrSet,
    modes: TerminalModes,
    title: String,
}

impl Default for AnsiInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl AnsiInterpreter {
    pub fn new() -> Self {
        Self {
            state: ParserState::Ground,
            params: String::with_capacity(16),
            private: None,
            intermediates: String::new(),
            osc: String::new(),
            text: String::new(),
            attrs: AttrSet::default(),
            modes: TerminalModes::default(),
            title: String::new(),
        }
    }

    /// Currently active attributes.
    pub fn attrs(&self) -> AttrSet {
        self.attrs
    }

    pub fn modes(&self) -> TerminalModes {
        self.modes
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// True while an escape sequence is partially received.
    pub fn in_sequence(&self) -> bool {
        self.state != ParserState::Ground
    }

    /// Feed one chunk of output and return the resulting actions in order.
    pub fn feed(&mut self, chunk: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        for ch in chunk.chars() {
            self.advance(ch, &mut actions);
        }
        self.flush_text(&mut actions);
        actions
    }

    /// Feed a chunk and apply it to `buffer`.
    ///
    /// Returns the new title if this chunk changed it.
    pub fn process(&mut self, chunk: &str, buffer: &mut DisplayBuffer) -> Option<String> {
        let mut title = None;
        for action in self.feed(chunk) {
            if let Action::SetTitle(t) = &action {
                title = Some(t.clone());
            }
            apply(buffer, action);
        }
        title
    }

    fn flush_text(&mut self, actions: &mut Vec<Action>) {
        if !self.text.is_empty() {
            let text = std::mem::take(&mut self.text);
            actions.push(Action::Print(StyledRun::new(text, self.attrs)));
        }
    }

    fn enter_escape(&mut self) {
        self.state = ParserState::Escape;
        self.params.clear();
        self.private = None;
        self.intermediates.clear();
    }

    fn advance(&mut self, ch: char, actions: &mut Vec<Action>) {
        match self.state {
            ParserState::Ground => self.ground(ch),
            ParserState::Escape => self.escape(ch, actions),
            ParserState::EscapeIntermediate => self.escape_intermediate(ch),
            ParserState::Csi => self.csi(ch, actions),
            ParserState::CsiIgnore => self.csi_ignore(ch),
            ParserState::OscString => self.osc_string(ch, actions),
            ParserState::EscapeInOsc => self.escape_in_osc(ch, actions),
        }
    }

    fn ground(&mut self, ch: char) {
        match ch {
            '\x1b' => self.enter_escape(),
            '\n' | '\r' | '\t' | '\x08' => self.text.push(ch),
            c if c.is_control() => {}
            c => self.text.push(c),
        }
    }

    fn escape(&mut self, ch: char, actions: &mut Vec<Action>) {
        match ch {
            '[' => self.state = ParserState::Csi,
            ']' => {
                self.osc.clear();
                self.state = ParserState::OscString;
            }
            '\x1b' => self.enter_escape(),
            'c' => {
                // RIS - full reset
                self.flush_text(actions);
                self.attrs.reset();
                self.modes = TerminalModes::default();
                actions.push(Action::EraseDisplay(2));
                self.state = ParserState::Ground;
            }
            '\x20'..='\x2f' => {
                self.intermediates.push(ch);
                self.state = ParserState::EscapeIntermediate;
            }
            _ => {
                // Two-character sequences (ESC 7, ESC =, ...) have no buffer effect
                self.state = ParserState::Ground;
            }
        }
    }

    fn escape_intermediate(&mut self, ch: char) {
        match ch {
            '\x20'..='\x2f' => self.intermediates.push(ch),
            // Charset designations and the like
            _ => self.state = ParserState::Ground,
        }
    }

    fn csi(&mut self, ch: char, actions: &mut Vec<Action>) {
        match ch {
            '0'..='9' | ';' | ':' => {
                if self.params.len() >= MAX_CSI_LEN {
                    debug!("Dropping oversized CSI sequence");
                    self.state = ParserState::CsiIgnore;
                } else {
                    self.params.push(ch);
                }
            }
            '?' | '>' | '=' | '!' if self.params.is_empty() && self.private.is_none() => {
                self.private = Some(ch);
            }
            '\x20'..='\x2f' => self.intermediates.push(ch),
            '\x40'..='\x7e' => {
                self.flush_text(actions);
                self.execute_csi(ch, actions);
                self.state = ParserState::Ground;
            }
            '\x1b' => self.enter_escape(),
            '\n' | '\r' | '\t' | '\x08' => self.text.push(ch),
            c if c.is_control() => {}
            _ => {
                // Not a valid CSI; drop it
                self.state = ParserState::Ground;
            }
        }
    }

    fn csi_ignore(&mut self, ch: char) {
        match ch {
            '\x40'..='\x7e' => self.state = ParserState::Ground,
            '\x1b' => self.enter_escape(),
            _ => {}
        }
    }

    fn osc_string(&mut self, ch: char, actions: &mut Vec<Action>) {
        match ch {
            '\x07' | '\u{9c}' => {
                self.execute_osc(actions);
                self.state = ParserState::Ground;
            }
            '\x1b' => self.state = ParserState::EscapeInOsc,
            _ => {
                if self.osc.len() < MAX_OSC_LEN {
                    self.osc.push(ch);
                }
            }
        }
    }

    fn escape_in_osc(&mut self, ch: char, actions: &mut Vec<Action>) {
        self.execute_osc(actions);
        if ch == '\\' {
            // ST (ESC \)
            self.state = ParserState::Ground;
        } else {
            // Not ST: the ESC starts a new sequence
            self.enter_escape();
            self.escape(ch, actions);
        }
    }

    /// Parameters with empty positions defaulting to 0.
    fn parse_params(&self) -> Vec<u16> {
        if self.params.is_empty() {
            return Vec::new();
        }
        self.params
            .split([';', ':'])
            .map(|p| {
                p.bytes().fold(0u16, |acc, b| {
                    acc.saturating_mul(10).saturating_add((b - b'0') as u16)
                })
            })
            .collect()
    }

    fn execute_csi(&mut self, final_char: char, actions: &mut Vec<Action>) {
        let params = self.parse_params();
        let param = |i: usize| params.get(i).copied().unwrap_or(0);

        if let Some(marker) = self.private {
            match (marker, final_char) {
                ('?', 'h') => params.iter().for_each(|&p| self.modes.set(p, true)),
                ('?', 'l') => params.iter().for_each(|&p| self.modes.set(p, false)),
                _ => debug!("Ignoring private CSI {}{}{}", marker, self.params, final_char),
            }
            return;
        }
        if !self.intermediates.is_empty() {
            debug!("Ignoring CSI with intermediates {:?}", self.intermediates);
            return;
        }

        match final_char {
            'm' => self.execute_sgr(&params),
            'H' | 'f' => {
                // Wire format is 1-based; 0 means 1
                let row = param(0).max(1) as usize - 1;
                let col = param(1).max(1) as usize - 1;
                actions.push(Action::CursorTo {
                    row: Some(row),
                    col,
                });
            }
            'G' => {
                let col = param(0).max(1) as usize - 1;
                actions.push(Action::CursorTo { row: None, col });
            }
            'J' => actions.push(Action::EraseDisplay(param(0))),
            'K' => actions.push(Action::EraseLine(param(0))),
            _ => debug!("Unknown CSI: params={:?}, final={:?}", self.params, final_char),
        }
    }

    fn execute_sgr(&mut self, params: &[u16]) {
        if params.is_empty() {
            self.attrs.reset();
            return;
        }

        let mut iter = params.iter().copied();
        while let Some(code) = iter.next() {
            match code {
                0 => self.attrs.reset(),
                1 => self.attrs.flags |= StyleFlags::BOLD,
                2 => self.attrs.flags |= StyleFlags::DIM,
                4 => self.attrs.flags |= StyleFlags::UNDERLINE,
                5 => self.attrs.flags |= StyleFlags::BLINK,
                7 => self.attrs.flags |= StyleFlags::REVERSE,
                8 => self.attrs.flags |= StyleFlags::HIDDEN,

                22 => self.attrs.flags &= !(StyleFlags::BOLD | StyleFlags::DIM),
                24 => self.attrs.flags &= !StyleFlags::UNDERLINE,
                25 => self.attrs.flags &= !StyleFlags::BLINK,
                27 => self.attrs.flags &= !StyleFlags::REVERSE,
                28 => self.attrs.flags &= !StyleFlags::HIDDEN,

                30..=37 => self.attrs.fg = Some(Color::Indexed((code - 30) as u8)),
                90..=97 => self.attrs.fg = Some(Color::Indexed((code - 90 + 8) as u8)),
                39 => self.attrs.fg = None,

                40..=47 => self.attrs.bg = Some(Color::Indexed((code - 40) as u8)),
                100..=107 => self.attrs.bg = Some(Color::Indexed((code - 100 + 8) as u8)),
                49 => self.attrs.bg = None,

                // Extended colors consume their arguments even when malformed
                38 => {
                    if let Some(color) = extended_color(&mut iter) {
                        self.attrs.fg = Some(color);
                    }
                }
                48 => {
                    if let Some(color) = extended_color(&mut iter) {
                        self.attrs.bg = Some(color);
                    }
                }

                _ => {}
            }
        }
    }

    fn execute_osc(&mut self, actions: &mut Vec<Action>) {
        let Some((code, text)) = self.osc.split_once(';') else {
            return;
        };
        if matches!(code, "0" | "1" | "2") {
            let title = text.to_string();
            self.flush_text(actions);
            self.title = title;
            actions.push(Action::SetTitle(self.title.clone()));
        }
    }
}

/// `5;n` (256 color) or `2;r;g;b` after a 38/48 code.
fn extended_color(iter: &mut impl Iterator<Item = u16>) -> Option<Color> {
    match iter.next()? {
        5 => iter.next().map(|n| Color::Indexed(n.min(255) as u8)),
        2 => {
            let r = iter.next()?.min(255) as u8;
            let g = iter.next()?.min(255) as u8;
            let b = iter.next()?.min(255) as u8;
            Some(Color::Rgb(r, g, b))
        }
        _ => None,
    }
}

/// Apply one action to a display buffer.
pub fn apply(buffer: &mut DisplayBuffer, action: Action) {
    match action {
        Action::Print(run) => buffer.write_text(&run.text, run.attrs),
        Action::CursorTo { row, col } => buffer.move_to(row, col),
        Action::EraseDisplay(mode) => buffer.erase_display(mode),
        Action::EraseLine(mode) => buffer.erase_line(mode),
        Action::SetTitle(_) => {}
    }
}
