//! Chat command parser.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    End,
}

/// Parses `/start`, `/end` and `/stop`, with or without a `@botname`
/// suffix. Arguments after the command word are ignored.
pub fn parse_command(input: &str) -> Option<BotCommand> {
    let trimmed = input.trim();
    let word = trimmed.strip_prefix('/')?.split_whitespace().next()?;
    let name = word.split_once('@').map_or(word, |(name, _bot)| name);

    match name.to_ascii_lowercase().as_str() {
        "start" => Some(BotCommand::Start),
        "end" | "stop" => Some(BotCommand::End),
        _ => None,
    }
}
