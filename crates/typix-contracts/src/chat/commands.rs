/// One line typed into the interactive chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    Noop,
    Prompt(String),
    SetProvider(String),
    SetModel(String),
    /// Paths queued as attachments for the next prompt.
    Attach(Vec<String>),
    Regenerate,
    Status,
    Help,
    Quit,
    Unknown { command: String, arg: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Provider,
    Model,
    Attach,
    Regenerate,
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, Copy)]
struct CommandSpec {
    command: &'static str,
    kind: CommandKind,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "provider",
        kind: CommandKind::Provider,
    },
    CommandSpec {
        command: "model",
        kind: CommandKind::Model,
    },
    CommandSpec {
        command: "attach",
        kind: CommandKind::Attach,
    },
    CommandSpec {
        command: "regen",
        kind: CommandKind::Regenerate,
    },
    CommandSpec {
        command: "regenerate",
        kind: CommandKind::Regenerate,
    },
    CommandSpec {
        command: "status",
        kind: CommandKind::Status,
    },
    CommandSpec {
        command: "help",
        kind: CommandKind::Help,
    },
    CommandSpec {
        command: "quit",
        kind: CommandKind::Quit,
    },
    CommandSpec {
        command: "exit",
        kind: CommandKind::Quit,
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/provider",
    "/model",
    "/attach",
    "/regen",
    "/status",
    "/help",
    "/quit",
];

fn find_kind(command: &str) -> Option<CommandKind> {
    COMMANDS
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.kind)
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

pub fn parse_chat_input(text: &str) -> ChatInput {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ChatInput::Noop;
    }

    if let Some(slash_tail) = trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();
            return match find_kind(&command) {
                Some(CommandKind::Provider) => ChatInput::SetProvider(arg.to_string()),
                Some(CommandKind::Model) => ChatInput::SetModel(arg.to_string()),
                Some(CommandKind::Attach) => ChatInput::Attach(parse_path_args(arg)),
                Some(CommandKind::Regenerate) => ChatInput::Regenerate,
                Some(CommandKind::Status) => ChatInput::Status,
                Some(CommandKind::Help) => ChatInput::Help,
                Some(CommandKind::Quit) => ChatInput::Quit,
                None => ChatInput::Unknown {
                    command,
                    arg: arg.to_string(),
                },
            };
        }
    }

    ChatInput::Prompt(trimmed.to_string())
}
