//! ANSI interpretation and the styled display buffer.

pub mod parser;
pub mod state;

pub use parser::{apply, Action, AnsiInterpreter, TerminalModes};
pub use state::{AttrSet, Color, Cursor, DisplayBuffer, StyleFlags, StyledRun};
