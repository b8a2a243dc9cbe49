//! Terminal input: one line is one command.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    File(PathBuf),
    Typing,
    Peers,
    Reload,
    Quit,
    Help,
    Empty,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Self::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Self::Say(line.to_owned());
        };
        // "//text" sends a line that starts with a slash
        if rest.starts_with('/') {
            return Self::Say(rest.to_owned());
        }
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match name {
            "file" if !arg.is_empty() => Self::File(PathBuf::from(arg)),
            "typing" => Self::Typing,
            "peers" => Self::Peers,
            "reload" => Self::Reload,
            "quit" | "exit" => Self::Quit,
            "help" => Self::Help,
            _ => Self::Unknown(name.to_owned()),
        }
    }
}

pub const HELP: &str = "\
commands:
  <text>         send a chat message
  /file <path>   send a file (10 MB max)
  /typing        send a typing indicator
  /peers         list peers in the room
  /reload        reload configuration
  /quit          leave the room and exit";
