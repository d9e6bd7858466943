//! Line-oriented transaction scripts.
//!
//! One command per line, `#` starts a comment:
//!
//! ```text
//! new-session <name>            open (or switch to) a session
//! begin
//! savepoint <name>
//! release <name>
//! rollback-to <name>
//! put <table> <key> <value>
//! delete <table> <key>
//! get <key>
//! commit
//! abort
//! ```
//!
//! Commands run against the current session, initially one named `main`.
//! Transaction errors are reported in the output and the script continues;
//! malformed lines stop it.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context};

use crate::{Database, Session};

const DEFAULT_SESSION: &str = "main";

/// Executes scripts against one database, keeping sessions across calls.
pub struct ScriptRunner<'a> {
    db: &'a Database,
    sessions: BTreeMap<String, Session>,
    current: String,
}

impl<'a> ScriptRunner<'a> {
    /// Runner with a single session named `main`.
    pub fn new(db: &'a Database) -> Self {
        let mut sessions = BTreeMap::new();
        sessions.insert(DEFAULT_SESSION.to_string(), db.session(DEFAULT_SESSION));
        Self { db, sessions, current: DEFAULT_SESSION.to_string() }
    }

    /// Run every line of `script`, returning one output line per command.
    pub async fn run(&mut self, script: &str) -> anyhow::Result<Vec<String>> {
        let mut out = Vec::new();
        for (n, raw) in script.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let words: Vec<&str> = line.split_whitespace().collect();
            let output = self.execute(&words).await.with_context(|| format!("line {}: {line}", n + 1))?;
            out.push(format!("[{}] {line} -> {output}", self.current));
        }
        Ok(out)
    }

    async fn execute(&mut self, words: &[&str]) -> anyhow::Result<String> {
        if let ["new-session", name] = words {
            let db = self.db;
            self.sessions.entry(name.to_string()).or_insert_with(|| db.session(*name));
            self.current = name.to_string();
            return Ok("ok".to_string());
        }
        let session = self
            .sessions
            .get_mut(&self.current)
            .ok_or_else(|| anyhow!("no session {}", self.current))?;
        let result = match words {
            ["begin"] => session.begin().await.map(|txn| format!("txn {}", txn.id)),
            ["savepoint", name] => session.set_savepoint(name).await.map(|d| format!("depth {d}")),
            ["release", name] => session.release_savepoint(name).await.map(|d| format!("depth {d}")),
            ["rollback-to", name] => session.rollback_to_savepoint(name).await.map(|d| format!("depth {d}")),
            ["put", table, key, value] => session.put(table, key.as_bytes(), value.as_bytes()).await.map(|_| "ok".to_string()),
            ["delete", table, key] => session.delete(table, key.as_bytes()).await.map(|_| "ok".to_string()),
            ["get", key] => session.get(key.as_bytes()).await.map(|v| match v {
                Some(v) => String::from_utf8_lossy(&v).into_owned(),
                None => "(none)".to_string(),
            }),
            ["commit"] => session.commit().await.map(|ts| match ts {
                Some(ts) => format!("committed at {ts}"),
                None => "nothing to commit".to_string(),
            }),
            ["abort"] => session.abort().await.map(|_| "aborted".to_string()),
            _ => bail!("unrecognized command"),
        };
        Ok(result.unwrap_or_else(|e| format!("error: {e}")))
    }
}
