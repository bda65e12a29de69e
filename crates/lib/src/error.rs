//! Error categories shared by the settings store, the Gemini client, and the chat bridge.
//!
//! Each module keeps its own `thiserror` enum; `ErrorKind` is the coarse category a
//! shell switches on (e.g. to tell "fix your key" apart from "the network failed").

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Empty or placeholder API key; rejected before any network activity.
    InvalidKey,
    /// Any fault from the remote call or from consuming its stream.
    TransportFailure,
    /// The settings file exists but could not be parsed.
    CorruptSettings,
    /// A settings commit carried out-of-range values.
    InvalidSettings,
    /// A send or reset was requested while a send is in flight.
    Busy,
    /// Reading or writing a local file failed.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidKey => "invalid key",
            ErrorKind::TransportFailure => "transport failure",
            ErrorKind::CorruptSettings => "corrupt settings",
            ErrorKind::InvalidSettings => "invalid settings",
            ErrorKind::Busy => "busy",
            ErrorKind::Io => "i/o",
        };
        f.write_str(s)
    }
}
