//! Firmware version ordering and update policy
//!
//! Device and index version strings are dotted, loosely formatted tags
//! like `v0.21`, `1.2.0` or `1.2.0-rc1`. Comparison is total over parsed
//! versions: numeric segments order numerically, alphanumeric pre-release
//! segments order a version before its plain release, and a leading `v`
//! is ignored. A string that does not look like a version at all never
//! raises an error; it degrades to [VersionCmp::Unknown] with a logged
//! warning, because a receiver with garbled settings must still be
//! flashable.

use std::cmp::Ordering;

use log::warn;

/// Outcome of comparing a local against a remote version
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionCmp {
    /// Local is older than remote.
    Less,
    Equal,
    /// Local is newer than remote.
    Greater,
    /// One side is missing or unparsable.
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Number(u64),
    Text(String),
}

/// A parsed, totally ordered firmware version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirmwareVersion {
    segments: Vec<Segment>,
}

impl FirmwareVersion {
    /// Parse a version string. Returns `None` unless the string starts
    /// with a numeric segment (after an optional leading `v`).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let raw = raw.strip_prefix(['v', 'V']).unwrap_or(raw);
        if raw.is_empty() {
            return None;
        }

        let segments: Vec<Segment> = raw
            .split(['.', '-'])
            .map(|part| match part.parse::<u64>() {
                Ok(number) => Segment::Number(number),
                Err(_) => Segment::Text(part.to_ascii_lowercase()),
            })
            .collect();

        match segments.first() {
            Some(Segment::Number(_)) => Some(FirmwareVersion { segments }),
            _ => None,
        }
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());

        for i in 0..len {
            let ordering = match (self.segments.get(i), other.segments.get(i)) {
                (Some(Segment::Number(a)), Some(Segment::Number(b))) => a.cmp(b),
                (Some(Segment::Text(a)), Some(Segment::Text(b))) => a.cmp(b),
                // A release segment outranks any pre-release text.
                (Some(Segment::Number(_)), Some(Segment::Text(_))) => Ordering::Greater,
                (Some(Segment::Text(_)), Some(Segment::Number(_))) => Ordering::Less,
                // `1.2.0-rc1` sorts before `1.2.0`, but `1.2.0.1` after.
                (Some(Segment::Text(_)), None) => Ordering::Less,
                (Some(Segment::Number(_)), None) => Ordering::Greater,
                (None, Some(Segment::Text(_))) => Ordering::Greater,
                (None, Some(Segment::Number(_))) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };

            if ordering != Ordering::Equal {
                return ordering;
            }
        }

        Ordering::Equal
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare a local version against a remote one.
pub fn compare(local: Option<&str>, remote: Option<&str>) -> VersionCmp {
    let local = local.and_then(parse_logged);
    let remote = remote.and_then(parse_logged);

    match (local, remote) {
        (Some(local), Some(remote)) => match local.cmp(&remote) {
            Ordering::Less => VersionCmp::Less,
            Ordering::Equal => VersionCmp::Equal,
            Ordering::Greater => VersionCmp::Greater,
        },
        _ => VersionCmp::Unknown,
    }
}

/// Whether a target running `local` should be updated to `remote`.
///
/// True iff remote > local. A missing local version with a known remote
/// counts as outdated; a missing or unparsable remote never forces an
/// update.
pub fn is_outdated(local: Option<&str>, remote: Option<&str>) -> bool {
    match (
        local.and_then(parse_logged),
        remote.and_then(parse_logged),
    ) {
        (Some(local), Some(remote)) => remote > local,
        (None, Some(_)) => {
            warn!("Installed firmware version is unknown, assuming an update is needed");
            true
        }
        (_, None) => {
            warn!("Latest firmware version is unknown, cannot compare versions");
            false
        }
    }
}

fn parse_logged(raw: &str) -> Option<FirmwareVersion> {
    let version = FirmwareVersion::parse(raw);
    if version.is_none() {
        warn!("'{raw}' does not parse as a firmware version");
    }
    version
}

/// Installed and available versions for one target
#[derive(Clone, Debug, Default)]
pub struct VersionPair {
    pub installed: Option<String>,
    pub available: Option<String>,
}

impl VersionPair {
    pub fn new(installed: Option<String>, available: Option<String>) -> Self {
        VersionPair {
            installed,
            available,
        }
    }

    pub fn comparison(&self) -> VersionCmp {
        compare(self.installed.as_deref(), self.available.as_deref())
    }

    pub fn is_outdated(&self) -> bool {
        is_outdated(self.installed.as_deref(), self.available.as_deref())
    }
}

/// Immutable view of all resolved versions, captured when a session
/// starts so that its decisions cannot change mid-flight
#[derive(Clone, Debug, Default)]
pub struct VersionSnapshot {
    pub application: VersionPair,
    pub coprocessor: VersionPair,
    /// This host tool itself, compared against the index's tool entry.
    pub tool: VersionPair,
}
