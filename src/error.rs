//! Library and application errors

use std::io;

use miette::Diagnostic;
#[cfg(feature = "serialport")]
use slip_codec::SlipError;
use thiserror::Error;

use crate::{link::MessageKind, targets::Target};

/// All possible errors returned by navflash
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Sector {sector} of the {target} flash is protected")]
    #[diagnostic(
        code(navflash::protected_sector),
        help("The sector holds the bootloader or other protected data and can never be erased or written")
    )]
    ProtectedSector { target: Target, sector: u32 },

    #[error("No bootloader handshake received from the device")]
    #[diagnostic(
        code(navflash::handshake_timeout),
        help("Press the reset button on the device to put it into bootloader mode")
    )]
    HandshakeTimeout,

    #[error("Firmware image is not a valid Intel HEX file")]
    #[diagnostic(
        code(navflash::malformed_image),
        help("Verify that the file is an unmodified firmware release for this device")
    )]
    MalformedImage(#[from] HexRecordError),

    #[error("Record address {addr:#010x} is outside the {target} flash range")]
    #[diagnostic(
        code(navflash::address_out_of_range),
        help("Check that the file matches the selected target; the application and coprocessor images are not interchangeable")
    )]
    AddressOutOfRange { addr: u32, target: Target },

    #[error("Failed to load the remote firmware index: {0}")]
    #[diagnostic(
        code(navflash::network),
        help("Version comparison is unavailable; updates can still be performed from local image files")
    )]
    Network(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    DeviceWrite(#[from] DeviceWriteError),

    #[error("A firmware update session is already in progress")]
    #[diagnostic(
        code(navflash::update_in_progress),
        help("Wait for the current session to finish; concurrent sessions are rejected, not queued")
    )]
    UpdateInProgress,

    #[error("Operation was cancelled by the user")]
    #[diagnostic(code(navflash::cancelled))]
    Cancelled,

    #[error("No firmware image supplied for the {0} target")]
    #[diagnostic(
        code(navflash::missing_image),
        help("Provide a firmware image for every target selected for update")
    )]
    MissingImage(Target),

    #[error("No serial port specified")]
    #[diagnostic(
        code(navflash::no_serial),
        help("Provide a port with the `-p/--port` option or set one in navflash.toml")
    )]
    NoSerial,

    #[error("Failed to open file: {0}")]
    FileOpen(String, #[source] io::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Link(#[from] LinkError),
}

#[cfg(feature = "serialport")]
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Link(err.into())
    }
}

#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Link(err.into())
    }
}

/// Errors on the message link to the device
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum LinkError {
    #[error("Timeout while waiting for a {0} acknowledgment")]
    #[diagnostic(code(navflash::link::timeout))]
    Timeout(MessageKind),

    #[error("The link to the device is closed")]
    #[diagnostic(
        code(navflash::link::closed),
        help("Ensure that the device is connected and the serial adapter is recognized by the host")
    )]
    Closed,

    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(
        code(navflash::link::framing),
        help("Try hard-resetting the device and try again")
    )]
    Framing,

    #[error("Received packet too large for buffer")]
    #[diagnostic(code(navflash::link::oversized_packet))]
    OverSizedPacket,

    #[error("Received message with an invalid payload")]
    #[diagnostic(code(navflash::link::invalid_message))]
    InvalidMessage,

    #[cfg(feature = "serialport")]
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(navflash::link::serial))]
    Serial(#[source] serialport::Error),

    #[cfg(not(feature = "serialport"))]
    #[error("IO error on the device link: {0}")]
    #[diagnostic(code(navflash::link::io))]
    Io(#[source] io::Error),
}

#[cfg(feature = "serialport")]
impl From<io::Error> for LinkError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

#[cfg(not(feature = "serialport"))]
impl From<io::Error> for LinkError {
    fn from(err: io::Error) -> Self {
        LinkError::Io(err)
    }
}

#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
impl From<serialport::Error> for LinkError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::Io(kind) => from_error_kind(kind, err),
            ErrorKind::NoDevice => LinkError::Closed,
            _ => LinkError::Serial(err),
        }
    }
}

#[cfg(feature = "serialport")]
impl From<SlipError> for LinkError {
    fn from(err: SlipError) -> Self {
        match err {
            SlipError::FramingError => Self::Framing,
            SlipError::OversizedPacket => Self::OverSizedPacket,
            SlipError::ReadError(io) => Self::from(io),
            SlipError::EndOfStream => Self::Closed,
        }
    }
}

#[cfg(feature = "serialport")]
fn from_error_kind<E>(kind: io::ErrorKind, err: E) -> LinkError
where
    E: Into<serialport::Error>,
{
    use io::ErrorKind;

    match kind {
        ErrorKind::TimedOut => LinkError::Timeout(MessageKind::Unknown),
        ErrorKind::NotFound => LinkError::Closed,
        _ => LinkError::Serial(err.into()),
    }
}

/// A flash erase or program operation the device rejected or never
/// acknowledged
///
/// The session that hit this error ends immediately; the flash is left
/// exactly as the last successful operation left it, and no rollback is
/// attempted. The recorded sector and address say how far the write got.
#[derive(Debug, Diagnostic, Error)]
#[error("Device failed {command} at sector {sector}, address {addr:#010x}")]
#[non_exhaustive]
pub struct DeviceWriteError {
    command: MessageKind,
    sector: u32,
    addr: u32,
    #[source]
    kind: FlashResponseCode,
}

impl DeviceWriteError {
    pub fn new(command: MessageKind, sector: u32, addr: u32, kind: FlashResponseCode) -> Self {
        DeviceWriteError {
            command,
            sector,
            addr,
            kind,
        }
    }

    /// Sector the failed operation targeted.
    pub fn sector(&self) -> u32 {
        self.sector
    }

    /// Address the failed operation targeted.
    pub fn addr(&self) -> u32 {
        self.addr
    }
}

/// Status codes reported by the bootloader in flash acknowledgments
#[derive(Clone, Copy, Debug, Default, Diagnostic, Error, PartialEq, Eq, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum FlashResponseCode {
    #[error("Requested sector does not exist")]
    #[diagnostic(code(navflash::flash::invalid_sector))]
    InvalidSector = 0x01,

    #[error("Bootloader failed to erase the sector")]
    #[diagnostic(code(navflash::flash::erase_failed))]
    EraseFailed = 0x02,

    #[error("Bootloader failed to program the data")]
    #[diagnostic(code(navflash::flash::write_failed))]
    WriteFailed = 0x03,

    #[error("Device is not in bootloader mode")]
    #[diagnostic(code(navflash::flash::not_in_bootloader))]
    NotInBootloader = 0x04,

    #[error("No acknowledgment received before the timeout")]
    #[diagnostic(code(navflash::flash::no_ack))]
    NoAck = 0xfe,

    #[default]
    #[error("Other")]
    #[diagnostic(code(navflash::flash::other))]
    Other = 0xff,
}

impl From<u8> for FlashResponseCode {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// A syntactically invalid Intel HEX record
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum HexRecordError {
    #[error("line {line}: record does not start with ':'")]
    MissingStartCode { line: usize },

    #[error("line {line}: record contains an invalid hex digit")]
    InvalidHex { line: usize },

    #[error("line {line}: record length does not match its byte count")]
    LengthMismatch { line: usize },

    #[error("line {line}: checksum mismatch (expected {expected:#04x}, computed {computed:#04x})")]
    ChecksumMismatch {
        line: usize,
        expected: u8,
        computed: u8,
    },

    #[error("line {line}: unsupported record type {kind:#04x}")]
    UnsupportedType { line: usize, kind: u8 },

    #[error("missing end-of-file record")]
    MissingEof,
}
