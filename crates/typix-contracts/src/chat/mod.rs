mod commands;
mod generation;
mod records;

pub use commands::{parse_chat_input, ChatInput, CHAT_HELP_COMMANDS};
pub use generation::{
    Generation, GenerationKind, GenerationStatus, ObservedStatus, Outcome, TransitionError,
    GENERATING_WINDOW_SECS,
};
pub use records::{new_id, Attachment, AttachmentType, Chat, Message, MessageType, Role};
