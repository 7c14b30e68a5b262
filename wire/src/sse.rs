//! Incremental server-sent-events parser.
//!
//! Feeds on raw bytes as they arrive from the network and yields complete
//! `(event, data)` records. Handles CRLF line endings, multi-line `data:`
//! fields (joined with `\n`), and `:` comment lines.

/// One parsed SSE record.
#[derive(Debug, Clone, PartialEq)]
pub struct SseRecord {
    /// Value of the `event:` field, if any.
    pub event: Option<String>,
    /// Concatenated `data:` payload.
    pub data: String,
}

/// Incremental parser over an SSE byte stream.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes; returns every record completed by this input.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseRecord> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut records = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if let Some(record) = self.take_record() {
                    records.push(record);
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix("event:") {
                self.event = Some(rest.trim_start().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data_lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            } else if line.starts_with(':') {
                // comment / heartbeat
            }
        }
        records
    }

    /// Flushes a trailing record that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseRecord> {
        self.take_record()
    }

    fn take_record(&mut self) -> Option<SseRecord> {
        if self.data_lines.is_empty() && self.event.is_none() {
            return None;
        }
        let record = SseRecord {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        };
        self.data_lines.clear();
        Some(record)
    }
}
