//! Framing alphabet. All five are single Unicode code points so the response
//! post-processor can walk model output character by character.

/// Opens an embedded command call.
pub const COMMAND_START: char = '\u{25B6}';

/// Closes an embedded command call or result.
pub const COMMAND_END: char = '\u{25A0}';

/// Separates a command statement from its stdin-like data payload.
pub const STDIN_SEPARATOR: char = '\u{FF5C}';

/// First character of a successful command result.
pub const SUCCESS_PREFIX: char = '\u{2705}';

/// First character of a failed command result.
pub const ERROR_PREFIX: char = '\u{274C}';

/// The full alphabet, in the order used by the escaper.
pub const FRAMING_CHARS: [char; 5] = [
    COMMAND_START,
    COMMAND_END,
    STDIN_SEPARATOR,
    SUCCESS_PREFIX,
    ERROR_PREFIX,
];
