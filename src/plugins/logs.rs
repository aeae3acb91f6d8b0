//! LogChunkIngestor: budgeted, idempotent, append-only log accumulation.
//!
//! Chunks are keyed by (directive, stream, seq). A repeated key is a no-op
//! apart from propagating its truncation flag. The combined stdout+stderr
//! size is capped per directive; only the prefix that fits is stored.

use crate::core::error::MarshalError;
use crate::core::time;
use crate::plugins::directive::{self, DirectiveState};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogStream {
    type Err = MarshalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(LogStream::Stdout),
            "stderr" => Ok(LogStream::Stderr),
            other => Err(MarshalError::InvalidParam(format!(
                "stream must be stdout or stderr, got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogChunk<'a> {
    pub stream: LogStream,
    pub seq: i64,
    pub bytes: &'a [u8],
    /// The territory already dropped output before this chunk.
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogChunkOutcome {
    pub stored: bool,
    pub duplicate: bool,
    pub accepted_bytes: i64,
    pub truncated: bool,
}

pub struct LogChunkIngestor {
    budget_bytes: i64,
    max_chunk_bytes: usize,
}

impl LogChunkIngestor {
    pub fn new(budget_bytes: i64, max_chunk_bytes: usize) -> Self {
        Self {
            budget_bytes,
            max_chunk_bytes,
        }
    }

    pub fn ingest(
        &self,
        conn: &Connection,
        directive_id: &str,
        chunk: &LogChunk<'_>,
        now: i64,
    ) -> Result<LogChunkOutcome, MarshalError> {
        if chunk.seq < 0 {
            return Err(MarshalError::InvalidParam("seq must be >= 0".to_string()));
        }
        if chunk.bytes.len() > self.max_chunk_bytes {
            return Err(MarshalError::InvalidParam(format!(
                "chunk of {} bytes exceeds the {} byte limit",
                chunk.bytes.len(),
                self.max_chunk_bytes
            )));
        }

        if chunk_exists(conn, directive_id, chunk.stream, chunk.seq)? {
            return self.duplicate(conn, directive_id, chunk);
        }

        let rec = directive::require_directive(conn, directive_id)?;
        if !matches!(rec.state, DirectiveState::Leased | DirectiveState::Running) {
            return Err(MarshalError::InvalidState(format!(
                "directive {} is {}; logs are closed",
                directive_id, rec.state
            )));
        }

        let remaining = (self.budget_bytes - rec.total_log_bytes()).max(0);
        let len = chunk.bytes.len() as i64;
        let accepted = len.min(remaining);

        if len > 0 && accepted == 0 {
            directive::mark_truncated(conn, directive_id, chunk.stream.as_str())?;
            tracing::debug!(directive = directive_id, stream = %chunk.stream, "log budget exhausted");
            return Ok(LogChunkOutcome {
                stored: false,
                duplicate: false,
                accepted_bytes: 0,
                truncated: true,
            });
        }

        let prefix = &chunk.bytes[..accepted as usize];
        let inserted = conn.execute(
            "INSERT INTO log_chunks(id, directive_id, stream, seq, bytes, byte_len, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                time::new_id(),
                directive_id,
                chunk.stream.as_str(),
                chunk.seq,
                prefix,
                accepted,
                now
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) => {
                let err = MarshalError::from(err);
                if err.is_unique_violation() {
                    return self.duplicate(conn, directive_id, chunk);
                }
                return Err(err);
            }
        }

        let truncated = chunk.truncated || accepted < len;
        if truncated {
            directive::mark_truncated(conn, directive_id, chunk.stream.as_str())?;
        }
        directive::add_stream_bytes(conn, directive_id, chunk.stream.as_str(), accepted)?;

        Ok(LogChunkOutcome {
            stored: true,
            duplicate: false,
            accepted_bytes: accepted,
            truncated,
        })
    }

    fn duplicate(
        &self,
        conn: &Connection,
        directive_id: &str,
        chunk: &LogChunk<'_>,
    ) -> Result<LogChunkOutcome, MarshalError> {
        if chunk.truncated {
            directive::mark_truncated(conn, directive_id, chunk.stream.as_str())?;
        }
        let rec = directive::require_directive(conn, directive_id)?;
        let truncated = match chunk.stream {
            LogStream::Stdout => rec.stdout_truncated,
            LogStream::Stderr => rec.stderr_truncated,
        };
        Ok(LogChunkOutcome {
            stored: false,
            duplicate: true,
            accepted_bytes: 0,
            truncated,
        })
    }
}

fn chunk_exists(
    conn: &Connection,
    directive_id: &str,
    stream: LogStream,
    seq: i64,
) -> Result<bool, MarshalError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM log_chunks WHERE directive_id = ?1 AND stream = ?2 AND seq = ?3",
            params![directive_id, stream.as_str(), seq],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Stored output of one stream, concatenated in seq order.
pub fn read_stream(conn: &Connection, directive_id: &str, stream: LogStream) -> Result<Vec<u8>, MarshalError> {
    let mut stmt = conn.prepare(
        "SELECT bytes FROM log_chunks WHERE directive_id = ?1 AND stream = ?2 ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map(params![directive_id, stream.as_str()], |row| {
        row.get::<_, Vec<u8>>(0)
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.extend_from_slice(&row?);
    }
    Ok(out)
}
