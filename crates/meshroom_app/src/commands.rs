//! Slash-command parsing for the console front end.

/// Help line shown by `/help` and on unknown commands.
pub const HELP_TEXT: &str =
    "Available commands: /join <room> [passphrase], /nick <name>, /clear, /help, /ip, /peers, /quit";

/// One line of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Plain text to send to the current room.
    Say(String),
    Command(Command),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Switch to a room; a passphrase makes it encrypted.
    Join { room: String, passphrase: Option<String> },
    Nick(String),
    Clear,
    Help,
    Ip,
    Peers,
    Quit,
    /// A recognised command missing its argument.
    Usage(&'static str),
    Unknown(String),
}

impl Input {
    /// Parse a console line. Returns `None` for blank input.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if !line.starts_with('/') {
            return Some(Self::Say(line.to_string()));
        }

        let mut parts = line.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let arg = parts.next().map(str::to_string);

        let command = match name {
            "/join" => match arg {
                Some(room) => Command::Join {
                    room,
                    passphrase: parts.next().map(str::to_string),
                },
                None => Command::Usage("/join <room> [passphrase]"),
            },
            "/nick" => match arg {
                Some(nick) => Command::Nick(nick),
                None => Command::Usage("/nick <name>"),
            },
            "/clear" => Command::Clear,
            "/help" => Command::Help,
            "/ip" => Command::Ip,
            "/peers" => Command::Peers,
            "/quit" | "/exit" => Command::Quit,
            other => Command::Unknown(other.to_string()),
        };
        Some(Self::Command(command))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
