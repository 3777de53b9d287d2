pub const USAGE: &str =
    "commands: /peer <id> | /peer | /login <id> <password> | /logout | /status | /quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptCommand {
    /// An empty id clears the selection.
    Peer(String),
    Login { id: String, password: String },
    Logout,
    Status,
    Quit,
    Say(String),
    Usage,
}

/// `None` for blank lines. Anything not starting with `/` is a message, sent as typed.
pub fn parse_line(line: &str) -> Option<PromptCommand> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed.starts_with('/') {
        return Some(PromptCommand::Say(line.trim_end_matches(['\r', '\n']).to_string()));
    }

    let mut words = trimmed.split_whitespace();
    let command = match words.next().unwrap_or_default() {
        "/peer" => PromptCommand::Peer(words.next().unwrap_or_default().to_string()),
        "/login" => match (words.next(), words.next()) {
            (Some(id), Some(password)) => PromptCommand::Login {
                id: id.to_string(),
                password: password.to_string(),
            },
            _ => PromptCommand::Usage,
        },
        "/logout" => PromptCommand::Logout,
        "/status" => PromptCommand::Status,
        "/quit" | "/exit" => PromptCommand::Quit,
        _ => PromptCommand::Usage,
    };
    Some(command)
}
