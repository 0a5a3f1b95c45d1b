//! Core type definitions for HFetch
//!
//! This module defines the value types exchanged between the auditor, the
//! data manager and the I/O clients. Every type that crosses a process
//! boundary serializes as a positional tuple, so field order is part of the
//! wire contract and must not change.

use crate::error::Error;
use bytes::Bytes;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use xxhash_rust::xxh64::xxh64;

/// Logical timestamp in microseconds since the global clock epoch
pub type HTime = u64;

/// Longest filename accepted on the wire (the fixed-size name buffer)
pub const MAX_FILENAME_LEN: usize = 256;

/// Fixed-capacity filename shared between processes
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(try_from = "String", into = "String")]
#[display("{_0}")]
pub struct FileName(String);

impl FileName {
    /// Create a new filename (validates length and content)
    pub fn new(name: impl Into<String>) -> Result<Self, FileNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the filename as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> Result<(), FileNameError> {
        if name.is_empty() {
            return Err(FileNameError::Empty);
        }
        if name.len() > MAX_FILENAME_LEN {
            return Err(FileNameError::TooLong(name.len()));
        }
        if name.contains('\0') {
            return Err(FileNameError::ContainsNul);
        }
        Ok(())
    }
}

impl TryFrom<String> for FileName {
    type Error = FileNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for FileName {
    type Error = FileNameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FileName> for String {
    fn from(name: FileName) -> Self {
        name.0
    }
}

impl fmt::Debug for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileName({:?})", self.0)
    }
}

/// Errors that can occur when creating a filename
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileNameError {
    #[error("filename must not be empty")]
    Empty,
    #[error("filename is {0} bytes, at most {MAX_FILENAME_LEN} allowed")]
    TooLong(usize),
    #[error("filename must not contain NUL")]
    ContainsNul,
}

/// An enumeration value that does not map to any known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what} discriminant {value}")]
pub struct InvalidDiscriminant {
    pub what: &'static str,
    pub value: u8,
}

/// Index of a storage layer (0 is the fastest)
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into,
    Display,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct LayerId(pub u8);

/// Inclusive byte range `[start, end]` of a file
///
/// Segments order by `start` first, so a sorted set of non-overlapping
/// segments is ordered by file position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "(i64, i64)", into = "(i64, i64)")]
pub struct Segment {
    pub start: i64,
    pub end: i64,
}

impl Segment {
    /// Create a segment; callers guarantee `start <= end`
    #[must_use]
    pub const fn new(start: i64, end: i64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Create a segment from untrusted bounds
    pub fn try_new(start: i64, end: i64) -> Result<Self, Error> {
        if start > end {
            return Err(Error::InvalidSegment { start, end });
        }
        Ok(Self { start, end })
    }

    /// Segment covering `len` bytes starting at `offset` (`len >= 1`)
    #[must_use]
    pub const fn from_offset_len(offset: i64, len: i64) -> Self {
        Self::new(offset, offset + len - 1)
    }

    /// Number of bytes covered
    #[must_use]
    pub const fn size(&self) -> u64 {
        (self.end - self.start + 1) as u64
    }

    /// True if this segment covers the whole of `o`, or covers `o`'s last byte.
    ///
    /// This is deliberately not symmetric: `[0,99].contains([50,250])` is
    /// false while `[50,250].contains([0,99])` is true. Use [`Self::overlaps`]
    /// to test for any shared byte.
    #[must_use]
    pub const fn contains(&self, o: &Segment) -> bool {
        (self.start <= o.start && self.end >= o.end) || (self.start <= o.end && self.end >= o.end)
    }

    /// True if the two segments share at least one byte
    #[must_use]
    pub const fn overlaps(&self, o: &Segment) -> bool {
        self.contains(o) || o.contains(self)
    }

    /// Parts of `self` not covered by `o`: zero, one or two leftovers, in order
    #[must_use]
    pub fn subtract(&self, o: &Segment) -> Vec<Segment> {
        if !self.overlaps(o) {
            return vec![*self];
        }
        let mut left_over = Vec::with_capacity(2);
        if self.start < o.start {
            left_over.push(Segment::new(self.start, o.start - 1));
        }
        if self.end > o.end {
            left_over.push(Segment::new(o.end + 1, self.end));
        }
        left_over
    }

    /// Overlapping sub-range of `self` and `o`, if any
    #[must_use]
    pub fn intersect(&self, o: &Segment) -> Option<Segment> {
        if !self.overlaps(o) {
            return None;
        }
        Some(Segment::new(self.start.max(o.start), self.end.min(o.end)))
    }

    /// The same range moved by `delta` bytes
    #[must_use]
    pub const fn shift(&self, delta: i64) -> Segment {
        Segment::new(self.start + delta, self.end + delta)
    }
}

impl TryFrom<(i64, i64)> for Segment {
    type Error = Error;

    fn try_from((start, end): (i64, i64)) -> Result<Self, Self::Error> {
        Self::try_new(start, end)
    }
}

impl From<Segment> for (i64, i64) {
    fn from(s: Segment) -> Self {
        (s.start, s.end)
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.start, self.end)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.start, self.end)
    }
}

/// Which component of a [`SegmentScore`] ranks segments
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreKind {
    /// Plain access count
    #[default]
    Frequency,
    /// Exponentially decayed recency-frequency value
    Lrf,
}

/// Heat of a segment
///
/// On the wire only `(frequency, lrf)` is carried; `kind` is a local
/// setting and decodes as [`ScoreKind::default`].
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "(u64, f64)", into = "(u64, f64)")]
pub struct SegmentScore {
    pub frequency: u64,
    pub lrf: f64,
    pub kind: ScoreKind,
}

impl SegmentScore {
    /// A cold score ranked by `kind`
    #[must_use]
    pub fn with_kind(kind: ScoreKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// The comparable score value
    #[must_use]
    pub fn value(&self) -> f64 {
        match self.kind {
            ScoreKind::Frequency => self.frequency as f64,
            ScoreKind::Lrf => self.lrf,
        }
    }

    /// Account one access at logical time `time`.
    ///
    /// `lrf` gains `0.5^(lambda * t)` with `t` the access time in seconds.
    pub fn record_access(&mut self, time: HTime, lambda: f64) {
        self.frequency += 1;
        self.lrf += 0.5_f64.powf(lambda * time as f64 / 1_000_000.0);
    }

    /// Hotter scores sort first
    #[must_use]
    pub fn cmp_heat(&self, other: &SegmentScore) -> Ordering {
        other.value().total_cmp(&self.value())
    }
}

impl From<(u64, f64)> for SegmentScore {
    fn from((frequency, lrf): (u64, f64)) -> Self {
        Self {
            frequency,
            lrf,
            kind: ScoreKind::default(),
        }
    }
}

impl From<SegmentScore> for (u64, f64) {
    fn from(s: SegmentScore) -> Self {
        (s.frequency, s.lrf)
    }
}

/// Kind of file access reported by the interception layer
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EventType {
    Open = 0,
    Close = 1,
    Read = 2,
}

impl From<EventType> for u8 {
    fn from(t: EventType) -> Self {
        t as u8
    }
}

impl TryFrom<u8> for EventType {
    type Error = InvalidDiscriminant;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Open),
            1 => Ok(Self::Close),
            2 => Ok(Self::Read),
            _ => Err(InvalidDiscriminant {
                what: "event type",
                value,
            }),
        }
    }
}

/// Producer of an event
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EventSource {
    /// Intercepted application I/O
    #[default]
    Application = 0,
    /// Tier hardware monitor
    HardwareMonitor = 1,
}

impl From<EventSource> for u8 {
    fn from(s: EventSource) -> Self {
        s as u8
    }
}

impl TryFrom<u8> for EventSource {
    type Error = InvalidDiscriminant;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Application),
            1 => Ok(Self::HardwareMonitor),
            _ => Err(InvalidDiscriminant {
                what: "event source",
                value,
            }),
        }
    }
}

type EventWire = (FileName, Segment, EventType, EventSource, LayerId, HTime);

/// A file access notification
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "EventWire", into = "EventWire")]
pub struct Event {
    pub filename: FileName,
    pub segment: Segment,
    pub event_type: EventType,
    pub source: EventSource,
    /// Layer the accessed bytes were observed on
    pub layer: LayerId,
    pub time: HTime,
}

impl Event {
    /// Create an application event at time zero
    #[must_use]
    pub fn new(event_type: EventType, filename: FileName, segment: Segment, layer: LayerId) -> Self {
        Self {
            filename,
            segment,
            event_type,
            source: EventSource::Application,
            layer,
            time: 0,
        }
    }

    #[must_use]
    pub fn open(filename: FileName, segment: Segment, layer: LayerId) -> Self {
        Self::new(EventType::Open, filename, segment, layer)
    }

    #[must_use]
    pub fn read(filename: FileName, segment: Segment, layer: LayerId) -> Self {
        Self::new(EventType::Read, filename, segment, layer)
    }

    #[must_use]
    pub fn close(filename: FileName, segment: Segment, layer: LayerId) -> Self {
        Self::new(EventType::Close, filename, segment, layer)
    }

    /// Same event stamped with `time`
    #[must_use]
    pub fn at(mut self, time: HTime) -> Self {
        self.time = time;
        self
    }
}

impl From<EventWire> for Event {
    fn from((filename, segment, event_type, source, layer, time): EventWire) -> Self {
        Self {
            filename,
            segment,
            event_type,
            source,
            layer,
            time,
        }
    }
}

impl From<Event> for EventWire {
    fn from(e: Event) -> Self {
        (e.filename, e.segment, e.event_type, e.source, e.layer, e.time)
    }
}

type PosixFileWire = (FileName, Segment, LayerId, Bytes);

/// A byte range of a named blob on one layer
///
/// `data` is only populated while bytes are in flight between layers.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PosixFileWire", into = "PosixFileWire")]
pub struct PosixFile {
    pub filename: FileName,
    pub segment: Segment,
    pub layer: LayerId,
    pub data: Bytes,
}

impl PosixFile {
    /// Create a file view without data
    #[must_use]
    pub fn new(filename: FileName, segment: Segment, layer: LayerId) -> Self {
        Self {
            filename,
            segment,
            layer,
            data: Bytes::new(),
        }
    }

    /// Number of bytes covered
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.segment.size()
    }

    /// Same file and layer, different range, no data
    #[must_use]
    pub fn with_segment(&self, segment: Segment) -> Self {
        Self::new(self.filename.clone(), segment, self.layer)
    }

    /// Same file and range on another layer, no data
    #[must_use]
    pub fn on_layer(&self, layer: LayerId) -> Self {
        Self::new(self.filename.clone(), self.segment, layer)
    }
}

impl From<PosixFileWire> for PosixFile {
    fn from((filename, segment, layer, data): PosixFileWire) -> Self {
        Self {
            filename,
            segment,
            layer,
            data,
        }
    }
}

impl From<PosixFile> for PosixFileWire {
    fn from(f: PosixFile) -> Self {
        (f.filename, f.segment, f.layer, f.data)
    }
}

impl fmt::Debug for PosixFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PosixFile")
            .field("filename", &self.filename.as_str())
            .field("segment", &self.segment)
            .field("layer", &self.layer.0)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Server that owns the registry shard of `filename`
#[must_use]
pub fn shard_of(filename: &FileName, num_servers: u16) -> u16 {
    if num_servers <= 1 {
        return 0;
    }
    (xxh64(filename.as_str().as_bytes(), 0) % u64::from(num_servers)) as u16
}

/// Worker lane, out of `lanes`, that handles `filename` on its owning
/// server. Every event of a file goes through the same lane.
#[must_use]
pub fn lane_of(filename: &FileName, num_servers: u16, lanes: usize) -> usize {
    if lanes <= 1 {
        return 0;
    }
    // Drop the part of the hash that picked the server.
    let hash = xxh64(filename.as_str().as_bytes(), 0) / u64::from(num_servers.max(1));
    (hash % lanes as u64) as usize
}
