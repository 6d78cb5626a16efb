use std::fmt::Write as _;

use hashbrown::HashMap;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};

use crate::protocol::redis::{script_kind, CommandKind, RedisCommand, ScriptKind};

/// Lowercase hex SHA-1 of a script body, the identifier `EVALSHA` uses.
pub fn script_digest(body: &str) -> String {
    let digest = Sha1::digest(body.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        let _ = write!(hex, "{:02x}", byte);
    }
    hex
}

/// Explicit read/write classification of script bodies.
///
/// Entries are keyed by digest so that `EVAL <body>` and `EVALSHA <sha1>`
/// of the same script agree. Absent entries classify as `Write`.
#[derive(Debug, Default)]
pub struct ScriptTable {
    entries: RwLock<HashMap<String, bool>>,
}

impl ScriptTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_read_only(&self, body: &str, read_only: bool) {
        self.entries.write().insert(script_digest(body), read_only);
    }

    pub fn is_read_only_body(&self, body: &str) -> bool {
        self.is_read_only_digest(&script_digest(body))
    }

    pub fn is_read_only_digest(&self, digest: &str) -> bool {
        self.entries
            .read()
            .get(digest.to_ascii_lowercase().as_str())
            .copied()
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Maps a command to the node role that may serve it.
#[derive(Debug, Default)]
pub struct Classifier {
    scripts: ScriptTable,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripts(&self) -> &ScriptTable {
        &self.scripts
    }

    pub fn set_script_read_only(&self, body: &str, read_only: bool) {
        self.scripts.set_read_only(body, read_only);
    }

    pub fn classify(&self, command: &RedisCommand) -> CommandKind {
        match script_kind(command.command_name()) {
            Some(ScriptKind::ReadOnly) => CommandKind::Read,
            Some(ScriptKind::Body) => self.script_kind(command, |table, script| {
                table.is_read_only_body(script)
            }),
            Some(ScriptKind::Digest) => self.script_kind(command, |table, digest| {
                table.is_read_only_digest(digest)
            }),
            None => command.kind(),
        }
    }

    fn script_kind<F>(&self, command: &RedisCommand, lookup: F) -> CommandKind
    where
        F: Fn(&ScriptTable, &str) -> bool,
    {
        let read_only = command
            .arg(1)
            .and_then(|script| std::str::from_utf8(script).ok())
            .map(|script| lookup(&self.scripts, script))
            .unwrap_or(false);
        if read_only {
            CommandKind::Read
        } else {
            CommandKind::Write
        }
    }
}
