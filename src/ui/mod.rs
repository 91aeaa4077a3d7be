//! Local terminal input handling.
//!
//! - **keymapper**: crossterm key events and pastes to the byte sequences
//!   sent down a shell channel

pub mod keymapper;

pub use keymapper::{encode_key, encode_paste, is_disconnect_key, Modifiers};
