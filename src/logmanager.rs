//! Conversation log persistence.
//!
//! One directory per conversation:
//!
//! ```text
//! <logs_home>/<YYYY-MM-DD-name>/
//!   conversation.jsonl     main branch, one JSON message per line
//!   branches/<name>.jsonl  alternative tails
//!   workspace              optional symlink to the working directory
//! ```
//!
//! Appends write one line and fsync; history rewrites (undo, branch
//! switches) go through a temp file renamed into place, with the directory
//! fsynced after the rename. A [`LogManager`] holds an advisory lock on the
//! directory for its lifetime so two processes cannot write the same
//! conversation; read-only loads may skip the lock.

use crate::codeblock::extract_codeblocks;
use crate::message::{Message, Role};
use fs2::FileExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

const CONVERSATION_FILE: &str = "conversation.jsonl";
const BRANCHES_DIR: &str = "branches";
const LOCK_FILE: &str = ".lock";
const MAIN_BRANCH: &str = "main";

/// Ordered sequence of messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Log {
    messages: Vec<Message>,
}

impl Log {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    /// Content of the last codeblock in the log, optionally restricted to
    /// messages of one role.
    pub fn get_last_codeblock(&self, role: Option<Role>) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .filter(|msg| role.is_none_or(|r| msg.role == r))
            .find_map(|msg| {
                let blocks = extract_codeblocks(&msg.content);
                blocks.last().map(|b| b.content.clone())
            })
    }

    fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }
}

/// Advisory lock held for the LogManager's lifetime.
#[derive(Debug)]
struct DirLock {
    file: std::fs::File,
}

impl DirLock {
    fn acquire(logdir: &Path) -> crate::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(logdir.join(LOCK_FILE))?;
        file.try_lock_exclusive().map_err(|_| {
            crate::Error::Storage(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                format!("conversation is locked by another process: {}", logdir.display()),
            ))
        })?;
        Ok(Self { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = <std::fs::File as FileExt>::unlock(&self.file);
    }
}

/// Options for [`LogManager::load`].
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Take the exclusive directory lock. Disable for read-only listings.
    pub lock: bool,
    /// Branch to load; `main` if unset.
    pub branch: Option<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { lock: true, branch: None }
    }
}

/// Owns one conversation: its in-memory log, its directory, and the lock.
#[derive(Debug)]
pub struct LogManager {
    log: Log,
    logdir: PathBuf,
    branch: String,
    _lock: Option<DirLock>,
}

/// Full state of a conversation for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSnapshot {
    pub id: String,
    pub log: Vec<Message>,
    pub branches: BTreeMap<String, Vec<Message>>,
    pub workspace: Option<PathBuf>,
}

/// Summary entry for conversation listings.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationListItem {
    pub id: String,
    pub path: PathBuf,
    pub modified: chrono::DateTime<chrono::Utc>,
    pub messages: usize,
}

impl LogManager {
    /// Loads an existing conversation directory.
    pub fn load(logdir: impl Into<PathBuf>, opts: LoadOptions) -> crate::Result<Self> {
        let logdir = logdir.into();
        if !logdir.join(CONVERSATION_FILE).exists() {
            return Err(crate::Error::ConversationNotFound(
                logdir.display().to_string(),
            ));
        }

        let lock = if opts.lock {
            Some(DirLock::acquire(&logdir)?)
        } else {
            None
        };

        let branch = opts.branch.unwrap_or_else(|| MAIN_BRANCH.to_string());
        let file = branch_file(&logdir, &branch);
        if !file.exists() {
            return Err(crate::Error::ConversationNotFound(format!(
                "branch {branch} of {}",
                logdir.display()
            )));
        }
        let log = read_jsonl(&file)?;

        Ok(Self {
            log,
            logdir,
            branch,
            _lock: lock,
        })
    }

    /// Creates a new conversation directory with the given initial messages.
    pub fn create(logdir: impl Into<PathBuf>, initial_msgs: Vec<Message>) -> crate::Result<Self> {
        let logdir = logdir.into();
        if logdir.exists() {
            return Err(crate::Error::ConversationExists(
                logdir.display().to_string(),
            ));
        }
        std::fs::create_dir_all(&logdir)?;
        let lock = DirLock::acquire(&logdir)?;

        let mut manager = Self {
            log: Log::new(initial_msgs),
            logdir,
            branch: MAIN_BRANCH.to_string(),
            _lock: Some(lock),
        };
        manager.write()?;
        Ok(manager)
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn logdir(&self) -> &Path {
        &self.logdir
    }

    /// Conversation id: the directory name.
    pub fn name(&self) -> String {
        self.logdir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn current_branch(&self) -> &str {
        &self.branch
    }

    /// Workspace path: the `workspace` symlink target when present,
    /// otherwise the current directory.
    pub fn workspace(&self) -> PathBuf {
        let link = self.logdir.join("workspace");
        std::fs::read_link(&link)
            .ok()
            .or_else(|| link.exists().then_some(link))
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    /// Records the workspace as a symlink inside the conversation dir.
    pub fn set_workspace(&self, workspace: &Path) -> crate::Result<()> {
        let link = self.logdir.join("workspace");
        if !link.exists() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(workspace, &link)?;
        }
        Ok(())
    }

    /// Appends one message, durably, before returning.
    ///
    /// Timestamps are clamped so the on-disk order is monotone even if the
    /// caller constructed the message earlier.
    pub fn append(&mut self, msg: Message) -> crate::Result<()> {
        let mut msg = msg;
        if let Some(last) = self.log.last() {
            if msg.timestamp < last.timestamp {
                msg.timestamp = last.timestamp;
            }
        }

        let line = msg.to_json_line()?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_file())?;
        writeln!(file, "{line}")?;
        file.sync_all()?;

        self.log.push(msg);
        Ok(())
    }

    /// Rewrites the whole branch file atomically (temp file + rename +
    /// directory fsync).
    pub fn write(&self) -> crate::Result<()> {
        let target = self.current_file();
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut tmp = tempfile::NamedTempFile::new_in(&self.logdir)?;
        for msg in self.log.iter() {
            writeln!(tmp, "{}", msg.to_json_line()?)?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&target)
            .map_err(|e| crate::Error::Storage(e.error))?;

        // Make the rename itself durable.
        std::fs::File::open(&self.logdir)?.sync_all()?;
        Ok(())
    }

    /// Removes the last `n` messages and rewrites the file.
    pub fn undo(&mut self, n: usize) -> crate::Result<Vec<Message>> {
        let mut undone = Vec::new();
        for _ in 0..n {
            match self.log.messages.pop() {
                Some(msg) => undone.push(msg),
                None => break,
            }
        }
        if !undone.is_empty() {
            self.write()?;
        }
        Ok(undone)
    }

    /// Copies this conversation into a new directory and returns a manager
    /// for the copy.
    pub fn fork(&self, new_logdir: impl Into<PathBuf>) -> crate::Result<LogManager> {
        let new_logdir = new_logdir.into();
        if new_logdir.exists() {
            return Err(crate::Error::ConversationExists(
                new_logdir.display().to_string(),
            ));
        }
        let mut forked = LogManager::create(new_logdir, self.log.messages().to_vec())?;
        for name in self.branches() {
            if name != MAIN_BRANCH {
                let branch_log = read_jsonl(&branch_file(&self.logdir, &name))?;
                write_jsonl(&branch_file(&forked.logdir, &name), &branch_log)?;
            }
        }
        forked.write()?;
        Ok(forked)
    }

    /// Renames the conversation directory. With `keep_date`, the original
    /// date prefix is preserved.
    pub fn rename(&mut self, new_name: &str, keep_date: bool) -> crate::Result<()> {
        let parent = self
            .logdir
            .parent()
            .ok_or_else(|| crate::Error::invalid_input("conversation dir has no parent"))?;
        let dir_name = if keep_date {
            let old = self.name();
            // YYYY-MM-DD- prefix is 11 chars.
            let date = old.get(..11).unwrap_or_default().to_string();
            format!("{date}{new_name}")
        } else {
            new_name.to_string()
        };
        let new_dir = parent.join(dir_name);
        if new_dir.exists() {
            return Err(crate::Error::ConversationExists(
                new_dir.display().to_string(),
            ));
        }
        std::fs::rename(&self.logdir, &new_dir)?;
        self.logdir = new_dir;
        Ok(())
    }

    /// Names of all branches, `main` first.
    pub fn branches(&self) -> Vec<String> {
        let mut names = vec![MAIN_BRANCH.to_string()];
        if let Ok(entries) = std::fs::read_dir(self.logdir.join(BRANCHES_DIR)) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "jsonl") {
                    if let Some(stem) = path.file_stem() {
                        names.push(stem.to_string_lossy().to_string());
                    }
                }
            }
        }
        names.sort();
        names.dedup();
        names
    }

    /// Switches to a branch, creating it from the current tail if missing.
    pub fn switch_branch(&mut self, name: &str) -> crate::Result<()> {
        if name == self.branch {
            return Ok(());
        }
        let file = branch_file(&self.logdir, name);
        if file.exists() {
            self.log = read_jsonl(&file)?;
        } else {
            write_jsonl(&file, &self.log)?;
        }
        self.branch = name.to_string();
        Ok(())
    }

    /// Full conversation state for API responses.
    pub fn snapshot(&self) -> crate::Result<ConversationSnapshot> {
        let mut branches = BTreeMap::new();
        for name in self.branches() {
            if name == self.branch {
                continue;
            }
            let log = read_jsonl(&branch_file(&self.logdir, &name))?;
            branches.insert(name, log.messages.clone());
        }

        let workspace_link = self.logdir.join("workspace");
        Ok(ConversationSnapshot {
            id: self.name(),
            log: self.log.messages.clone(),
            branches,
            workspace: std::fs::read_link(workspace_link).ok(),
        })
    }

    fn current_file(&self) -> PathBuf {
        branch_file(&self.logdir, &self.branch)
    }
}

fn branch_file(logdir: &Path, branch: &str) -> PathBuf {
    if branch == MAIN_BRANCH {
        logdir.join(CONVERSATION_FILE)
    } else {
        logdir.join(BRANCHES_DIR).join(format!("{branch}.jsonl"))
    }
}

fn read_jsonl(path: &Path) -> crate::Result<Log> {
    let text = std::fs::read_to_string(path)?;
    let mut messages = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let msg: Message =
            serde_json::from_str(line).map_err(|source| crate::Error::LogParse {
                line: i + 1,
                source,
            })?;
        messages.push(msg);
    }
    Ok(Log::new(messages))
}

fn write_jsonl(path: &Path, log: &Log) -> crate::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    for msg in log.iter() {
        writeln!(file, "{}", msg.to_json_line()?)?;
    }
    file.sync_all()?;
    Ok(())
}

/// Lists conversations under a logs home, newest first. Read-only: takes
/// no locks.
pub fn list_conversations(
    logs_home: &Path,
    limit: usize,
) -> crate::Result<Vec<ConversationListItem>> {
    let mut items = Vec::new();
    let entries = match std::fs::read_dir(logs_home) {
        Ok(entries) => entries,
        Err(_) => return Ok(items),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let file = path.join(CONVERSATION_FILE);
        if !file.exists() {
            continue;
        }
        let metadata = std::fs::metadata(&file)?;
        let modified: chrono::DateTime<chrono::Utc> = metadata.modified()?.into();
        let messages = std::fs::read_to_string(&file)?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count();
        items.push(ConversationListItem {
            id: entry.file_name().to_string_lossy().to_string(),
            path,
            modified,
            messages,
        });
    }

    items.sort_by(|a, b| b.modified.cmp(&a.modified));
    items.truncate(limit);
    Ok(items)
}
