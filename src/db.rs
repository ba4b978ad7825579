//! The result cache: exit codes, run counts, and timings from previous
//! invocations, persisted per output path.
//!
//! The file is a sequence of variable-length little-endian records with no
//! header and no checksum: `i32` exit code (-1 when the action never ran),
//! `i32` run count, `u64` total nanoseconds, then the NUL-terminated output
//! path.  A missing or corrupt file is treated as an empty cache; losing it
//! only costs a cold start.

use crate::graph::Graph;
use crate::work::History;
use std::time::Duration;

/// Fixed-size prefix of each record.
const HEADER_LEN: usize = 16;

/// Exit-code field value for an action that has never run.
const NEVER_RAN: i32 = -1;

/// Cache file name used when the embedder has no better idea.
pub const DEFAULT_PATH: &str = ".ebb_cache";

fn read_i32(buf: &[u8], pos: usize) -> i32 {
    i32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

fn read_u64(buf: &[u8], pos: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[pos..pos + 8]);
    u64::from_le_bytes(bytes)
}

/// Load the cache at `path`, seeding the history of every action whose
/// output appears in it.  Reads records as long as a full header remains
/// before end-of-file; anything malformed ends the load silently.
pub fn load(path: &str, graph: &Graph, history: &mut [History]) {
    let buf = match std::fs::read(path) {
        Ok(buf) => buf,
        Err(_) => return,
    };
    let mut pos = 0;
    while pos + HEADER_LEN < buf.len() {
        let exit_code = read_i32(&buf, pos);
        let run_count = read_i32(&buf, pos + 4);
        let total_nanos = read_u64(&buf, pos + 8);
        let name_start = pos + HEADER_LEN;
        let name_end = match buf[name_start..].iter().position(|&b| b == 0) {
            Some(off) => name_start + off,
            None => return, // truncated final record
        };
        if let Ok(name) = std::str::from_utf8(&buf[name_start..name_end]) {
            if let Some(action) = graph.lookup(name).and_then(|f| graph.file(f).generating) {
                let entry = &mut history[action.index()];
                entry.last_exit_code = if exit_code == NEVER_RAN {
                    None
                } else {
                    Some(exit_code)
                };
                entry.run_count = run_count.max(0) as u32;
                entry.total_time = Duration::from_nanos(total_nanos);
            }
        }
        pos = name_end + 1;
    }
}

/// Write a record for every file with a generating action, overwriting the
/// cache in full.
pub fn save(path: &str, graph: &Graph, history: &[History]) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    for id in graph.all_files() {
        let file = graph.file(id);
        let action = match file.generating {
            Some(action) => action,
            None => continue,
        };
        let entry = &history[action.index()];
        buf.extend_from_slice(&entry.last_exit_code.unwrap_or(NEVER_RAN).to_le_bytes());
        buf.extend_from_slice(&(entry.run_count as i32).to_le_bytes());
        buf.extend_from_slice(&(entry.total_time.as_nanos() as u64).to_le_bytes());
        buf.extend_from_slice(file.name.as_bytes());
        buf.push(0);
    }
    std::fs::write(path, &buf)?;
    Ok(())
}
