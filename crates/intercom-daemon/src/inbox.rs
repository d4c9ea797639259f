//! Session inbox files.
//!
//! One JSON object per line, UTF-8, LF-terminated, at
//! `<state_dir>/inbox/<session_id>.jsonl`. The daemon's deliver path is
//! the single writer (append); the drain path is the single reader and
//! rewrites the file atomically to flip `read` flags. Callers serialise
//! the read-modify-write with a per-file mutex; no advisory file locks.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use intercom_types::{InboxEntry, IntercomError};

/// Append one entry to an inbox file, creating the directory and file as
/// needed. No fsync; a lost line on power failure is acceptable.
pub fn append_entry(path: &Path, entry: &InboxEntry) -> Result<(), IntercomError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    file.write_all(&line)?;
    Ok(())
}

/// Read every parseable entry. Unparseable lines are skipped.
pub fn read_entries(path: &Path) -> Result<Vec<InboxEntry>, IntercomError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

/// Number of unread entries.
pub fn pending_count(path: &Path) -> Result<usize, IntercomError> {
    Ok(read_entries(path)?.iter().filter(|e| !e.read).count())
}

/// Drain unread entries: return them and rewrite the file with every
/// entry marked read. The rewrite goes through a temp file and rename so
/// a crash mid-drain never truncates the inbox. Returns an empty vec when
/// nothing is unread (the file is left untouched then).
pub fn drain_unread(path: &Path) -> Result<Vec<InboxEntry>, IntercomError> {
    let mut entries = read_entries(path)?;
    let unread: Vec<InboxEntry> = entries.iter().filter(|e| !e.read).cloned().collect();
    if unread.is_empty() {
        return Ok(unread);
    }

    for entry in &mut entries {
        entry.read = true;
    }

    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        for entry in &entries {
            let mut line = serde_json::to_vec(entry)?;
            line.push(b'\n');
            file.write_all(&line)?;
        }
    }
    std::fs::rename(&tmp, path)?;
    Ok(unread)
}
