//! Firmware image parsing and validation
//!
//! Firmware for both processors is distributed as Intel HEX text. The
//! loader parses the data records, resolves extended segment/linear
//! address records into absolute addresses, coalesces adjacent rows, and
//! validates that every byte falls inside the selected target's declared
//! flash range before any device interaction happens. An image that
//! validates for one target is rejected for the other, which catches the
//! classic mistake of flashing the application file onto the coprocessor.

use std::{fs, path::Path};

use log::debug;

use crate::{
    error::{Error, HexRecordError},
    targets::Target,
};

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXT_SEGMENT: u8 = 0x02;
const RECORD_START_SEGMENT: u8 = 0x03;
const RECORD_EXT_LINEAR: u8 = 0x04;
const RECORD_START_LINEAR: u8 = 0x05;

/// One contiguous run of image data at an absolute address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub addr: u32,
    pub data: Vec<u8>,
}

impl Record {
    /// First address past the end of this record.
    pub fn end(&self) -> u32 {
        self.addr + self.data.len() as u32
    }
}

/// A parsed firmware image, validated for one target and immutable
/// thereafter
#[derive(Clone, Debug)]
pub struct FirmwareImage {
    records: Vec<Record>,
    target: Target,
}

impl FirmwareImage {
    /// Load and validate an Intel HEX file for `target`.
    pub fn load<P: AsRef<Path>>(path: P, target: Target) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| Error::FileOpen(path.display().to_string(), err))?;

        let image = Self::parse(&text, target)?;
        debug!(
            "Loaded {} with {} records for the {} target",
            path.display(),
            image.records.len(),
            target
        );

        Ok(image)
    }

    /// Parse Intel HEX text and validate every record against `target`'s
    /// address range.
    pub fn parse(text: &str, target: Target) -> Result<Self, Error> {
        let mut records: Vec<Record> = Vec::new();
        let mut base: u32 = 0;
        let mut saw_eof = false;

        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let number = index + 1;

            let raw = decode_record(line, number)?;
            let count = raw[0] as usize;
            let offset = u16::from_be_bytes([raw[1], raw[2]]) as u32;
            let kind = raw[3];
            let data = &raw[4..4 + count];

            match kind {
                RECORD_DATA => {
                    records.push(Record {
                        addr: base + offset,
                        data: data.to_vec(),
                    });
                }
                RECORD_EOF => {
                    saw_eof = true;
                    break;
                }
                RECORD_EXT_SEGMENT => {
                    if data.len() != 2 {
                        return Err(HexRecordError::LengthMismatch { line: number }.into());
                    }
                    base = (u16::from_be_bytes([data[0], data[1]]) as u32) << 4;
                }
                RECORD_EXT_LINEAR => {
                    if data.len() != 2 {
                        return Err(HexRecordError::LengthMismatch { line: number }.into());
                    }
                    base = (u16::from_be_bytes([data[0], data[1]]) as u32) << 16;
                }
                // Start-address records name an entry point, which flashing
                // has no use for.
                RECORD_START_SEGMENT | RECORD_START_LINEAR => {}
                kind => {
                    return Err(HexRecordError::UnsupportedType { line: number, kind }.into());
                }
            }
        }

        if !saw_eof {
            return Err(HexRecordError::MissingEof.into());
        }

        // Validated before coalescing: the end of a record placed near the
        // top of the 32-bit space does not fit in u32.
        let range = target.address_range();
        for record in &records {
            let end = record.addr as u64 + record.data.len() as u64;
            if !range.contains(&record.addr) || end > range.end as u64 {
                let addr = if range.contains(&record.addr) {
                    (end - 1) as u32
                } else {
                    record.addr
                };
                return Err(Error::AddressOutOfRange { addr, target });
            }
        }

        records.sort_by_key(|record| record.addr);
        let records = coalesce(records);

        Ok(FirmwareImage { records, target })
    }

    /// The ordered, coalesced data records.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// The target this image was validated for.
    pub fn target(&self) -> Target {
        self.target
    }

    /// Total number of data bytes in the image.
    pub fn len(&self) -> usize {
        self.records.iter().map(|record| record.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The span from the lowest to one past the highest address, if the
    /// image has any data.
    pub fn address_span(&self) -> Option<std::ops::Range<u32>> {
        let first = self.records.first()?;
        let last = self.records.last()?;

        Some(first.addr..last.end())
    }
}

/// Decode one hex record line into its raw bytes, checksum verified.
fn decode_record(line: &str, number: usize) -> Result<Vec<u8>, Error> {
    let body = line
        .strip_prefix(':')
        .ok_or(HexRecordError::MissingStartCode { line: number })?;

    if body.len() % 2 != 0 {
        return Err(HexRecordError::InvalidHex { line: number }.into());
    }

    let mut bytes = Vec::with_capacity(body.len() / 2);
    for pair in 0..body.len() / 2 {
        let byte = u8::from_str_radix(&body[pair * 2..pair * 2 + 2], 16)
            .map_err(|_| HexRecordError::InvalidHex { line: number })?;
        bytes.push(byte);
    }

    // Shortest legal record: count, offset, type, checksum.
    if bytes.len() < 5 || bytes.len() != bytes[0] as usize + 5 {
        return Err(HexRecordError::LengthMismatch { line: number }.into());
    }

    let expected = *bytes.last().unwrap();
    let sum: u8 = bytes[..bytes.len() - 1]
        .iter()
        .fold(0u8, |acc, byte| acc.wrapping_add(*byte));
    let computed = sum.wrapping_neg();
    if computed != expected {
        return Err(HexRecordError::ChecksumMismatch {
            line: number,
            expected,
            computed,
        }
        .into());
    }

    bytes.pop();
    Ok(bytes)
}

/// Merge records whose address ranges touch. Input must be sorted.
fn coalesce(records: Vec<Record>) -> Vec<Record> {
    let mut merged: Vec<Record> = Vec::with_capacity(records.len());

    for record in records {
        match merged.last_mut() {
            Some(last) if last.end() == record.addr => {
                last.data.extend_from_slice(&record.data);
            }
            _ => merged.push(record),
        }
    }

    merged
}
