//! Command table.

use std::fmt;
use std::str::FromStr;

use crate::ConnectorError;

/// Every command the connector understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Open,
    Ls,
    Tree,
    Parents,
    Info,
    Mkdir,
    Mkfile,
    Rename,
    Rm,
    Paste,
    Duplicate,
    Get,
    Put,
    Upload,
    Size,
    Dim,
    Resize,
    Archive,
    Extract,
    Search,
    Tmb,
    Zipdl,
    File,
    Abort,
}

impl Command {
    pub const ALL: [Command; 24] = [
        Command::Open,
        Command::Ls,
        Command::Tree,
        Command::Parents,
        Command::Info,
        Command::Mkdir,
        Command::Mkfile,
        Command::Rename,
        Command::Rm,
        Command::Paste,
        Command::Duplicate,
        Command::Get,
        Command::Put,
        Command::Upload,
        Command::Size,
        Command::Dim,
        Command::Resize,
        Command::Archive,
        Command::Extract,
        Command::Search,
        Command::Tmb,
        Command::Zipdl,
        Command::File,
        Command::Abort,
    ];

    /// Wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Open => "open",
            Command::Ls => "ls",
            Command::Tree => "tree",
            Command::Parents => "parents",
            Command::Info => "info",
            Command::Mkdir => "mkdir",
            Command::Mkfile => "mkfile",
            Command::Rename => "rename",
            Command::Rm => "rm",
            Command::Paste => "paste",
            Command::Duplicate => "duplicate",
            Command::Get => "get",
            Command::Put => "put",
            Command::Upload => "upload",
            Command::Size => "size",
            Command::Dim => "dim",
            Command::Resize => "resize",
            Command::Archive => "archive",
            Command::Extract => "extract",
            Command::Search => "search",
            Command::Tmb => "tmb",
            Command::Zipdl => "zipdl",
            Command::File => "file",
            Command::Abort => "abort",
        }
    }

    /// Parameters that must be present and non-empty.
    pub fn required(&self) -> &'static [&'static str] {
        match self {
            Command::Open | Command::Search => &[],
            Command::Ls
            | Command::Tree
            | Command::Parents
            | Command::Mkdir
            | Command::Get
            | Command::Put
            | Command::Upload
            | Command::Dim
            | Command::Extract
            | Command::File => &["target"],
            Command::Mkfile | Command::Rename => &["target", "name"],
            Command::Resize => &["target", "mode"],
            Command::Info
            | Command::Rm
            | Command::Duplicate
            | Command::Size
            | Command::Tmb
            | Command::Zipdl => &["targets[]"],
            Command::Paste => &["dst", "targets[]"],
            Command::Archive => &["targets[]", "type"],
            Command::Abort => &["id"],
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Command {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .iter()
            .copied()
            .find(|c| c.name() == s)
            .ok_or(ConnectorError::UnknownCommand)
    }
}
