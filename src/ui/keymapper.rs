//! Key mapping for remote shell input
//!
//! Turns crossterm key events into the byte sequences an xterm-compatible
//! remote expects, honouring the modes the remote has switched on.

use bitflags::bitflags;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use crate::core::term::TerminalModes;

bitflags! {
    /// Modifier keys
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const ALT   = 0b0010;
        const CTRL  = 0b0100;
    }
}

impl From<KeyModifiers> for Modifiers {
    fn from(mods: KeyModifiers) -> Self {
        let mut result = Modifiers::empty();
        result.set(Modifiers::SHIFT, mods.contains(KeyModifiers::SHIFT));
        result.set(Modifiers::ALT, mods.contains(KeyModifiers::ALT));
        result.set(Modifiers::CTRL, mods.contains(KeyModifiers::CONTROL));
        result
    }
}

impl Modifiers {
    /// xterm modifier parameter: 1 + shift + 2*alt + 4*ctrl
    fn xterm_param(self) -> u8 {
        1 + self.bits()
    }
}

/// Encode a key press. Returns `None` for keys with no terminal encoding and
/// for release events.
pub fn encode_key(event: &KeyEvent, modes: &TerminalModes) -> Option<Vec<u8>> {
    if event.kind == KeyEventKind::Release {
        return None;
    }
    let mods = Modifiers::from(event.modifiers);

    let bytes = match event.code {
        KeyCode::Char(ch) => encode_char(ch, mods),
        KeyCode::Enter => vec![b'\r'],
        KeyCode::Backspace if mods.contains(Modifiers::ALT) => vec![0x1b, 0x7f],
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Tab if mods.contains(Modifiers::SHIFT) => b"\x1b[Z".to_vec(),
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Tab => vec![b'\t'],
        KeyCode::Esc => vec![0x1b],

        KeyCode::Up => cursor_key(b'A', mods, modes),
        KeyCode::Down => cursor_key(b'B', mods, modes),
        KeyCode::Right => cursor_key(b'C', mods, modes),
        KeyCode::Left => cursor_key(b'D', mods, modes),
        KeyCode::Home => cursor_key(b'H', mods, modes),
        KeyCode::End => cursor_key(b'F', mods, modes),

        KeyCode::Insert => tilde_key(2, mods),
        KeyCode::Delete => tilde_key(3, mods),
        KeyCode::PageUp => tilde_key(5, mods),
        KeyCode::PageDown => tilde_key(6, mods),

        KeyCode::F(n @ 1..=4) => ss3_key(b'P' + (n - 1), mods),
        KeyCode::F(n) => tilde_key(function_key_code(n)?, mods),

        _ => return None,
    };
    Some(bytes)
}

/// Ctrl+] ends an interactive session.
///
/// Unix terminals deliver 0x1d, which crossterm reports as Ctrl+5.
pub fn is_disconnect_key(event: &KeyEvent) -> bool {
    event.kind != KeyEventKind::Release
        && event.modifiers.contains(KeyModifiers::CONTROL)
        && matches!(event.code, KeyCode::Char(']') | KeyCode::Char('5'))
}

/// Encode pasted text, wrapping it in paste brackets if the remote asked.
pub fn encode_paste(text: &str, modes: &TerminalModes) -> Vec<u8> {
    // Line endings go over the wire as CR, like typed Enter
    let body = text.replace("\r\n", "\r").replace('\n', "\r");
    if modes.bracketed_paste {
        let mut bytes = b"\x1b[200~".to_vec();
        bytes.extend_from_slice(body.as_bytes());
        bytes.extend_from_slice(b"\x1b[201~");
        bytes
    } else {
        body.into_bytes()
    }
}

fn encode_char(ch: char, mods: Modifiers) -> Vec<u8> {
    let ctrl = mods.contains(Modifiers::CTRL);
    let alt = mods.contains(Modifiers::ALT);

    let base = if ctrl {
        match control_code(ch) {
            Some(code) => vec![code],
            None => ch.to_string().into_bytes(),
        }
    } else {
        ch.to_string().into_bytes()
    };

    if alt {
        let mut bytes = vec![0x1b];
        bytes.extend(base);
        bytes
    } else {
        base
    }
}

/// Control character for Ctrl+`ch`, if there is one
fn control_code(ch: char) -> Option<u8> {
    match ch {
        'a'..='z' => Some(ch as u8 - b'a' + 1),
        'A'..='Z' => Some(ch as u8 - b'A' + 1),
        '@' | '`' | ' ' | '2' => Some(0x00),
        '[' | '3' => Some(0x1b),
        '\\' | '4' => Some(0x1c),
        ']' | '5' => Some(0x1d),
        '^' | '~' | '6' => Some(0x1e),
        '_' | '?' | '7' => Some(0x1f),
        '8' => Some(0x7f),
        _ => None,
    }
}

/// Arrows, Home and End
fn cursor_key(key: u8, mods: Modifiers, modes: &TerminalModes) -> Vec<u8> {
    if !mods.is_empty() {
        format!("\x1b[1;{}{}", mods.xterm_param(), key as char).into_bytes()
    } else if modes.application_cursor {
        vec![0x1b, b'O', key]
    } else {
        vec![0x1b, b'[', key]
    }
}

/// F1-F4
fn ss3_key(key: u8, mods: Modifiers) -> Vec<u8> {
    if mods.is_empty() {
        vec![0x1b, b'O', key]
    } else {
        format!("\x1b[1;{}{}", mods.xterm_param(), key as char).into_bytes()
    }
}

fn tilde_key(code: u8, mods: Modifiers) -> Vec<u8> {
    if mods.is_empty() {
        format!("\x1b[{}~", code).into_bytes()
    } else {
        format!("\x1b[{};{}~", code, mods.xterm_param()).into_bytes()
    }
}

fn function_key_code(n: u8) -> Option<u8> {
    match n {
        5 => Some(15),
        6..=10 => Some(n + 11),
        11 | 12 => Some(n + 12),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, mods: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, mods)
    }

    fn plain(code: KeyCode) -> Option<Vec<u8>> {
        encode_key(&key(code, KeyModifiers::NONE), &TerminalModes::default())
    }

    #[test]
    fn test_char_keys() {
        let modes = TerminalModes::default();
        assert_eq!(plain(KeyCode::Char('a')), Some(b"a".to_vec()));
        assert_eq!(plain(KeyCode::Char('é')), Some("é".as_bytes().to_vec()));
        assert_eq!(
            encode_key(&key(KeyCode::Char('c'), KeyModifiers::CONTROL), &modes),
            Some(vec![0x03])
        );
        assert_eq!(
            encode_key(&key(KeyCode::Char('x'), KeyModifiers::ALT), &modes),
            Some(vec![0x1b, b'x'])
        );
        assert_eq!(
            encode_key(
                &key(KeyCode::Char('d'), KeyModifiers::CONTROL | KeyModifiers::ALT),
                &modes
            ),
            Some(vec![0x1b, 0x04])
        );
    }

    #[test]
    fn test_editing_keys() {
        assert_eq!(plain(KeyCode::Enter), Some(vec![b'\r']));
        assert_eq!(plain(KeyCode::Backspace), Some(vec![0x7f]));
        assert_eq!(plain(KeyCode::Tab), Some(vec![b'\t']));
        assert_eq!(plain(KeyCode::BackTab), Some(b"\x1b[Z".to_vec()));
        assert_eq!(plain(KeyCode::Delete), Some(b"\x1b[3~".to_vec()));
        assert_eq!(plain(KeyCode::PageDown), Some(b"\x1b[6~".to_vec()));
    }

    #[test]
    fn test_cursor_keys_follow_mode() {
        let mut modes = TerminalModes::default();
        let up = key(KeyCode::Up, KeyModifiers::NONE);
        assert_eq!(encode_key(&up, &modes), Some(b"\x1b[A".to_vec()));

        modes.application_cursor = true;
        assert_eq!(encode_key(&up, &modes), Some(b"\x1bOA".to_vec()));
        assert_eq!(
            encode_key(&key(KeyCode::Home, KeyModifiers::NONE), &modes),
            Some(b"\x1bOH".to_vec())
        );

        // Modified keys ignore application mode
        assert_eq!(
            encode_key(&key(KeyCode::Up, KeyModifiers::CONTROL), &modes),
            Some(b"\x1b[1;5A".to_vec())
        );
    }

    #[test]
    fn test_function_keys() {
        assert_eq!(plain(KeyCode::F(1)), Some(b"\x1bOP".to_vec()));
        assert_eq!(plain(KeyCode::F(4)), Some(b"\x1bOS".to_vec()));
        assert_eq!(plain(KeyCode::F(5)), Some(b"\x1b[15~".to_vec()));
        assert_eq!(plain(KeyCode::F(6)), Some(b"\x1b[17~".to_vec()));
        assert_eq!(plain(KeyCode::F(10)), Some(b"\x1b[21~".to_vec()));
        assert_eq!(plain(KeyCode::F(12)), Some(b"\x1b[24~".to_vec()));
        assert_eq!(plain(KeyCode::F(13)), None);
        assert_eq!(
            encode_key(&key(KeyCode::F(2), KeyModifiers::SHIFT), &TerminalModes::default()),
            Some(b"\x1b[1;2Q".to_vec())
        );
    }

    #[test]
    fn test_release_ignored() {
        let mut event = key(KeyCode::Char('a'), KeyModifiers::NONE);
        event.kind = KeyEventKind::Release;
        assert_eq!(encode_key(&event, &TerminalModes::default()), None);
    }

    #[test]
    fn test_disconnect_key() {
        assert!(is_disconnect_key(&key(KeyCode::Char(']'), KeyModifiers::CONTROL)));
        assert!(is_disconnect_key(&key(KeyCode::Char('5'), KeyModifiers::CONTROL)));
        assert!(!is_disconnect_key(&key(KeyCode::Char(']'), KeyModifiers::NONE)));
        assert!(!is_disconnect_key(&key(KeyCode::Char('5'), KeyModifiers::NONE)));
        assert!(!is_disconnect_key(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)));

        let mut release = key(KeyCode::Char(']'), KeyModifiers::CONTROL);
        release.kind = KeyEventKind::Release;
        assert!(!is_disconnect_key(&release));
    }

    #[test]
    fn test_paste() {
        let mut modes = TerminalModes::default();
        assert_eq!(encode_paste("ls\npwd\n", &modes), b"ls\rpwd\r".to_vec());
        modes.bracketed_paste = true;
        assert_eq!(encode_paste("a\r\nb", &modes), b"\x1b[200~a\rb\x1b[201~".to_vec());
    }
}
