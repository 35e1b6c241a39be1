//! Operator commands.

use traverser_proto::PublicKey;

/// Command list shown by `help` and after invalid input
pub const HELP: &str = "\
Commands:
  add <host-id>            register with the server as host <host-id> (1-254) of the tunnel network
  connect <public-key>     ask the server for a peer and add it to the tunnel
  set consumer|provider    route all traffic through peers, or only their own range
  remove                   drop the server peer and talk to its public address again
  exit                     tell the server and quit
  help                     show this list
";

/// Full-tunnel or split-tunnel peer policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Route all traffic through applied peers
    Consumer,
    /// Route only each peer's own range
    Provider,
}

/// One line of operator input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `add <host-id>`
    Add(u32),
    /// `connect <public-key>`
    Connect(PublicKey),
    /// `set consumer|provider`
    SetMode(Mode),
    /// `remove`
    Remove,
    /// `exit`
    Exit,
    /// `help`
    Help,
    /// Blank line
    Empty,
    /// Anything else
    Invalid(String),
}

impl Command {
    /// Parse one input line.
    ///
    /// Mode names may be abbreviated to any prefix, so `set c` selects
    /// consumer mode.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let tokens: Vec<&str> = line.split_whitespace().collect();

        match tokens.as_slice() {
            [] => Command::Empty,
            ["add", host_id] => match host_id.parse() {
                Ok(id) => Command::Add(id),
                Err(_) => Command::Invalid(format!("invalid host id {host_id:?}")),
            },
            ["connect", key] => match key.parse() {
                Ok(key) => Command::Connect(key),
                Err(e) => Command::Invalid(format!("{e}")),
            },
            ["set", mode] if mode.starts_with('c') => Command::SetMode(Mode::Consumer),
            ["set", mode] if mode.starts_with('p') => Command::SetMode(Mode::Provider),
            ["set", mode] => Command::Invalid(format!("unknown mode {mode:?}")),
            ["remove"] => Command::Remove,
            ["exit"] => Command::Exit,
            ["help"] => Command::Help,
            [verb, ..] => Command::Invalid(format!("unrecognized command {verb:?}")),
        }
    }
}
