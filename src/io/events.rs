//! Raw-trace source: digitizer events stored as JSON lines.
//!
//! Each line is one `EventRecord`:
//!
//! ```text
//! {"entry": 17, "digitizers": {"caen_0": {"systemClock": .., "deviceClocks": [..], "channels": [[..], ..]}}}
//! ```
//!
//! The processing core only sees the `TraceSource` capability.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::RawTrace;
use crate::error::AppError;

/// Indexed sample access for one digitizer in one event.
pub trait TraceSource {
    /// Samples per channel.
    fn trace_len(&self) -> usize;

    fn channel_count(&self) -> usize;

    fn sample_at(&self, channel: usize, index: usize) -> Option<u16>;

    /// Borrow a whole channel trace.
    fn trace(&self, channel: usize) -> Option<RawTrace<'_>>;
}

/// One digitizer readout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigitizerEvent {
    pub system_clock: u64,
    /// One device clock per channel (a single shared value is also accepted).
    #[serde(default)]
    pub device_clocks: Vec<u64>,
    pub channels: Vec<Vec<u16>>,
}

impl DigitizerEvent {
    /// Check the shape against what the configured digitizer produces.
    pub fn check_shape(&self, channels: usize, trace_len: usize) -> Result<(), AppError> {
        if self.channels.len() != channels {
            return Err(AppError::format(
                "event",
                format!("expected {channels} channels, found {}", self.channels.len()),
            ));
        }
        if let Some((ch, t)) = self.channels.iter().enumerate().find(|(_, t)| t.len() != trace_len) {
            return Err(AppError::format(
                "event",
                format!("channel {ch} has {} samples, expected {trace_len}", t.len()),
            ));
        }
        Ok(())
    }

    fn device_clock(&self, channel: usize) -> u64 {
        match self.device_clocks.as_slice() {
            [] => self.system_clock,
            [shared] => *shared,
            clocks => clocks.get(channel).copied().unwrap_or(self.system_clock),
        }
    }
}

impl TraceSource for DigitizerEvent {
    fn trace_len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn sample_at(&self, channel: usize, index: usize) -> Option<u16> {
        self.channels.get(channel)?.get(index).copied()
    }

    fn trace(&self, channel: usize) -> Option<RawTrace<'_>> {
        let samples = self.channels.get(channel)?;
        Some(RawTrace::new(samples, self.device_clock(channel)))
    }
}

/// One event: every digitizer read out for an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub entry: u64,
    /// Keyed by branch name.
    pub digitizers: BTreeMap<String, DigitizerEvent>,
}

/// Streaming reader over a JSON-lines event file.
pub struct EventReader<R> {
    path: PathBuf,
    lines: Lines<R>,
    line_no: usize,
    start_entry: u64,
}

impl EventReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        let file = File::open(path).map_err(|e| AppError::io(path, e))?;
        Ok(Self::new(path, BufReader::new(file)))
    }
}

impl<R: BufRead> EventReader<R> {
    pub fn new(path: impl Into<PathBuf>, reader: R) -> Self {
        Self {
            path: path.into(),
            lines: reader.lines(),
            line_no: 0,
            start_entry: 0,
        }
    }

    /// Skip records whose entry number is below `entry`.
    pub fn starting_at(mut self, entry: u64) -> Self {
        self.start_entry = entry;
        self
    }
}

impl<R: BufRead> Iterator for EventReader<R> {
    type Item = Result<EventRecord, AppError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(AppError::io(&self.path, e))),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record: EventRecord = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    return Some(Err(AppError::format(
                        "event file",
                        format!("{}:{}: {e}", self.path.display(), self.line_no),
                    )));
                }
            };
            if record.entry < self.start_entry {
                continue;
            }
            return Some(Ok(record));
        }
    }
}

/// Write events as JSON lines.
pub fn write_events<'a>(
    path: &Path,
    events: impl IntoIterator<Item = &'a EventRecord>,
) -> Result<usize, AppError> {
    let file = File::create(path).map_err(|e| AppError::io(path, e))?;
    let mut out = BufWriter::new(file);
    let mut n = 0;
    for event in events {
        serde_json::to_writer(&mut out, event).map_err(|e| AppError::format("event file", e))?;
        out.write_all(b"\n").map_err(|e| AppError::io(path, e))?;
        n += 1;
    }
    out.flush().map_err(|e| AppError::io(path, e))?;
    Ok(n)
}

/// Collect one channel of one branch from every event in a file.
pub fn read_channel_traces(
    path: &Path,
    branch: &str,
    channel: usize,
    start_entry: u64,
) -> Result<Vec<Vec<u16>>, AppError> {
    let mut traces = Vec::new();
    for record in EventReader::open(path)?.starting_at(start_entry) {
        let record = record?;
        let Some(event) = record.digitizers.get(branch) else {
            tracing::debug!(entry = record.entry, branch, "branch missing from event");
            continue;
        };
        let trace = event.channels.get(channel).ok_or_else(|| {
            AppError::format(
                "event file",
                format!("entry {} has no channel {channel} in '{branch}'", record.entry),
            )
        })?;
        traces.push(trace.clone());
    }
    Ok(traces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn record(entry: u64) -> EventRecord {
        EventRecord {
            entry,
            digitizers: BTreeMap::from([(
                "caen_0".to_string(),
                DigitizerEvent {
                    system_clock: 10 * entry,
                    device_clocks: vec![1, 2],
                    channels: vec![vec![1, 2, 3], vec![4, 5, 6]],
                },
            )]),
        }
    }

    #[test]
    fn trace_source_access() {
        let event = &record(0).digitizers["caen_0"];
        assert_eq!(event.trace_len(), 3);
        assert_eq!(event.channel_count(), 2);
        assert_eq!(event.sample_at(1, 2), Some(6));
        assert_eq!(event.sample_at(2, 0), None);
        let t = event.trace(1).unwrap();
        assert_eq!(t.samples(), &[4, 5, 6]);
        assert_eq!(t.device_clock(), 2);
        assert!(event.check_shape(2, 3).is_ok());
        assert!(event.check_shape(32, 1024).is_err());
    }

    #[test]
    fn reader_skips_blank_lines_and_early_entries() {
        let text = [0, 1, 2]
            .iter()
            .map(|&e| serde_json::to_string(&record(e)).unwrap())
            .collect::<Vec<_>>()
            .join("\n\n");
        let reader = EventReader::new("mem", Cursor::new(text)).starting_at(1);
        let entries: Vec<u64> = reader.map(|r| r.unwrap().entry).collect();
        assert_eq!(entries, vec![1, 2]);
    }

    #[test]
    fn reader_reports_line_of_bad_record() {
        let text = format!("{}\nnot json\n", serde_json::to_string(&record(0)).unwrap());
        let mut reader = EventReader::new("events.jsonl", Cursor::new(text));
        assert!(reader.next().unwrap().is_ok());
        let err = reader.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("events.jsonl:2"), "{err}");
    }
}
