/// Chat line interpretation — slash-commands, nickname rules, chat text.
///
/// A line resolves to a list of [`Effect`]s; the session applies them. Nothing
/// in here touches a socket, the bus or the registries.
use chrono::{DateTime, Datelike, Local, TimeZone};

/// Error sent back when `/nick` gets an unacceptable name.
pub const NICK_ERROR: &str = "Username must only contain letters, digits and \
                              its length must be between 3 and 15 characters.";

/// Reply to `/exit`, sent right before the connection is closed.
pub const BYE: &str = "Bye.";

const NICK_MIN: usize = 3;
const NICK_MAX: usize = 15;

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line<'a> {
    /// Nothing to do.
    Empty,
    /// A `/command`.
    Command(Command),
    /// Plain chat text, broadcast as-is.
    Chat(&'a str),
}

/// A slash-command with its arguments already joined by single spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Time,
    Up(String),
    Down(String),
    Exit,
    Nick(String),
    /// Lower-cased name of a command we don't know.
    Unknown(String),
}

/// What a line asks the session to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Write to the originating connection only.
    Reply(String),
    /// Hand to the bus publisher. Never written to a session directly.
    Broadcast(String),
    /// Store a validated nickname for the originating identity.
    SetNick(String),
    /// Close the originating connection.
    Close,
}

/// Who sent a line: their connection identity and nickname, if any.
#[derive(Debug, Clone, Copy)]
pub struct Speaker<'a> {
    pub identity: &'a str,
    pub nick: Option<&'a str>,
}

impl Speaker<'_> {
    /// Nickname if set, else the identity.
    pub fn display(&self) -> &str {
        self.nick.unwrap_or(self.identity)
    }
}

impl<'a> Line<'a> {
    /// Parse a framed line (no trailing `\n`).
    pub fn parse(input: &'a str) -> Self {
        if input.is_empty() {
            return Line::Empty;
        }

        let Some(rest) = input.strip_prefix('/') else {
            return Line::Chat(input);
        };

        // The name ends at the first whitespace; `/ nick` has an empty name.
        let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let name = name.to_lowercase();
        let args = args.split_whitespace().collect::<Vec<_>>().join(" ");

        let command = match name.as_str() {
            "time" => Command::Time,
            "up" => Command::Up(args),
            "down" => Command::Down(args),
            "exit" => Command::Exit,
            "nick" => Command::Nick(args),
            _ => Command::Unknown(name),
        };
        Line::Command(command)
    }
}

/// Resolve a line against the current wall clock.
pub fn resolve(line: &Line<'_>, speaker: Speaker<'_>) -> Vec<Effect> {
    resolve_at(line, speaker, &Local::now())
}

/// Resolve a line, using `now` for `/time`.
pub fn resolve_at<Tz: TimeZone>(
    line: &Line<'_>,
    speaker: Speaker<'_>,
    now: &DateTime<Tz>,
) -> Vec<Effect>
where
    Tz::Offset: std::fmt::Display,
{
    match line {
        Line::Empty => Vec::new(),
        Line::Chat(text) => vec![Effect::Broadcast(format!(
            "{} says: {text}",
            speaker.display()
        ))],
        Line::Command(command) => match command {
            Command::Time => vec![Effect::Reply(format_time(now))],
            Command::Up(text) => vec![Effect::Reply(text.to_uppercase())],
            Command::Down(text) => vec![Effect::Reply(text.to_lowercase())],
            Command::Exit => vec![Effect::Reply(BYE.into()), Effect::Close],
            Command::Nick(candidate) => {
                if !is_valid_nick(candidate) {
                    return vec![Effect::Reply(NICK_ERROR.into())];
                }
                vec![
                    Effect::SetNick(candidate.clone()),
                    Effect::Broadcast(format!("{} is now {candidate}", speaker.display())),
                ]
            }
            Command::Unknown(name) => vec![Effect::Reply(format!("Unknown command: {name}"))],
        },
    }
}

/// Nicknames are 3 to 15 ASCII letters, digits, `-` or `.`.
pub fn is_valid_nick(nick: &str) -> bool {
    (NICK_MIN..=NICK_MAX).contains(&nick.len())
        && nick
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
}

/// `Friday 16th of October 2026 03:04:05 PM`
pub fn format_time<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let day = now.day();
    format!(
        "{} {day}{} of {}",
        now.format("%A"),
        ordinal_suffix(day),
        now.format("%B %Y %I:%M:%S %p"),
    )
}

fn ordinal_suffix(day: u32) -> &'static str {
    match (day % 10, day % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    }
}
