//! Wire-level data model shared by the neo engine and its hosts: the framing
//! alphabet used to embed command calls in model output, the content-block
//! sum type, and the `Message` record that conversation transcripts are made
//! of.

mod constants;
mod messages;

pub use constants::COMMAND_END;
pub use constants::COMMAND_START;
pub use constants::ERROR_PREFIX;
pub use constants::FRAMING_CHARS;
pub use constants::STDIN_SEPARATOR;
pub use constants::SUCCESS_PREFIX;
pub use messages::CommandOutput;
pub use messages::ContentBlock;
pub use messages::Message;
pub use messages::ParsedCommand;
pub use messages::escape_special_chars;
pub use messages::unescape_special_chars;
