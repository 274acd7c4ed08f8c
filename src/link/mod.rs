//! Typed message link to the device
//!
//! The bootloader protocol is a small set of framed messages: the host
//! resets the device, erases sectors, programs data, and finally tells the
//! bootloader to jump back into the application; the device answers with a
//! handshake when it enters bootloader mode and with one acknowledgment
//! per flash operation. The protocol is strictly sequential, so every
//! erase or program message blocks on its acknowledgment before the next
//! one may be sent.

use std::{
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    time::Duration,
};

use strum::Display;

use crate::error::LinkError;

#[cfg(test)]
pub(crate) mod mock;
#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
pub mod serial;

const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(3);
const ERASE_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages exchanged with the device's bootloader
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Message {
    /// Reset the device so it re-enters its bootloader.
    Reset,
    /// Erase one flash sector of the identified target.
    EraseSector { flash_id: u8, sector: u32 },
    /// Program a chunk of data at an absolute address.
    ProgramFlash { flash_id: u8, addr: u32, data: Vec<u8> },
    /// Leave bootloader mode and start the application firmware.
    JumpToApp,
    /// Device entered bootloader mode; carries the bootloader version.
    Handshake { version: String },
    /// Acknowledgment of an erase or program operation; zero means success.
    FlashDone { code: u8 },
}

/// Types of messages carried on the link
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum MessageKind {
    Unknown = 0x00,
    // Host to device
    Reset = 0x01,
    EraseSector = 0x02,
    ProgramFlash = 0x03,
    JumpToApp = 0x04,
    // Device to host
    Handshake = 0x10,
    FlashDone = 0x11,
}

impl MessageKind {
    /// How long to wait for the device's acknowledgment of this message.
    ///
    /// Sector erases on the coarse application flash routinely take
    /// several seconds, so they get a longer bound than program
    /// transfers.
    pub fn ack_timeout(&self) -> Duration {
        match self {
            MessageKind::EraseSector => ERASE_ACK_TIMEOUT,
            _ => DEFAULT_ACK_TIMEOUT,
        }
    }
}

impl Message {
    /// Return the message kind
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Reset => MessageKind::Reset,
            Message::EraseSector { .. } => MessageKind::EraseSector,
            Message::ProgramFlash { .. } => MessageKind::ProgramFlash,
            Message::JumpToApp => MessageKind::JumpToApp,
            Message::Handshake { .. } => MessageKind::Handshake,
            Message::FlashDone { .. } => MessageKind::FlashDone,
        }
    }

    /// Encode the message into its wire form: a one-byte tag followed by a
    /// little-endian payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.kind() as u8];

        match self {
            Message::Reset => {}
            Message::EraseSector { flash_id, sector } => {
                buf.push(*flash_id);
                buf.extend_from_slice(&sector.to_le_bytes());
            }
            Message::ProgramFlash {
                flash_id,
                addr,
                data,
            } => {
                buf.push(*flash_id);
                buf.extend_from_slice(&addr.to_le_bytes());
                buf.push(data.len() as u8);
                buf.extend_from_slice(data);
            }
            Message::JumpToApp => {
                // Jump target selector; zero means the application image.
                buf.push(0);
            }
            Message::Handshake { version } => {
                buf.extend_from_slice(version.as_bytes());
            }
            Message::FlashDone { code } => {
                buf.push(*code);
            }
        }

        buf
    }

    /// Decode a message from its wire form.
    pub fn decode(frame: &[u8]) -> Result<Self, LinkError> {
        let (tag, payload) = frame.split_first().ok_or(LinkError::InvalidMessage)?;
        let kind = MessageKind::from_repr(*tag).ok_or(LinkError::InvalidMessage)?;

        let message = match kind {
            MessageKind::Reset => Message::Reset,
            MessageKind::EraseSector => {
                if payload.len() != 5 {
                    return Err(LinkError::InvalidMessage);
                }
                Message::EraseSector {
                    flash_id: payload[0],
                    sector: u32::from_le_bytes(payload[1..5].try_into().unwrap()),
                }
            }
            MessageKind::ProgramFlash => {
                if payload.len() < 6 {
                    return Err(LinkError::InvalidMessage);
                }
                let len = payload[5] as usize;
                if payload.len() != 6 + len {
                    return Err(LinkError::InvalidMessage);
                }
                Message::ProgramFlash {
                    flash_id: payload[0],
                    addr: u32::from_le_bytes(payload[1..5].try_into().unwrap()),
                    data: payload[6..].to_vec(),
                }
            }
            MessageKind::JumpToApp => Message::JumpToApp,
            MessageKind::Handshake => Message::Handshake {
                version: String::from_utf8_lossy(payload).into_owned(),
            },
            MessageKind::FlashDone => {
                let code = *payload.first().ok_or(LinkError::InvalidMessage)?;
                Message::FlashDone { code }
            }
            MessageKind::Unknown => return Err(LinkError::InvalidMessage),
        };

        Ok(message)
    }
}

/// Callback invoked for every received message of a registered kind
pub type Handler = Box<dyn FnMut(&Message) + Send>;

/// A bidirectional message channel to the device
///
/// Implementations deliver received messages to at most one registered
/// handler per [MessageKind], on whatever thread reads the transport.
pub trait Link: Send + Sync {
    /// Send a message to the device.
    fn send(&self, message: Message) -> Result<(), LinkError>;

    /// Register `handler` for incoming messages of `kind`, replacing any
    /// previous handler for that kind.
    fn register(&self, kind: MessageKind, handler: Handler);

    /// Remove the handler for `kind`, if any.
    fn unregister(&self, kind: MessageKind);
}

/// A registered handler feeding received messages into a channel,
/// unregistered again on drop
pub struct Subscription<'a> {
    link: &'a dyn Link,
    kind: MessageKind,
    rx: Receiver<Message>,
}

impl<'a> Subscription<'a> {
    /// Subscribe to messages of `kind` on `link`.
    pub fn subscribe(link: &'a dyn Link, kind: MessageKind) -> Self {
        let (tx, rx): (Sender<Message>, Receiver<Message>) = mpsc::channel();

        link.register(
            kind,
            Box::new(move |message| {
                // The receiver may be gone while the link still dispatches;
                // those messages are dropped.
                let _ = tx.send(message.clone());
            }),
        );

        Subscription { link, kind, rx }
    }

    /// Wait up to `timeout` for the next message of the subscribed kind.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Message, LinkError> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Ok(message),
            Err(RecvTimeoutError::Timeout) => Err(LinkError::Timeout(self.kind)),
            Err(RecvTimeoutError::Disconnected) => Err(LinkError::Closed),
        }
    }

    /// Discard any messages received so far.
    pub fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        self.link.unregister(self.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_flash_messages() {
        let messages = [
            Message::Reset,
            Message::EraseSector {
                flash_id: 0,
                sector: 7,
            },
            Message::ProgramFlash {
                flash_id: 1,
                addr: 0x0800_4000,
                data: vec![0xde, 0xad, 0xbe, 0xef],
            },
            Message::JumpToApp,
            Message::Handshake {
                version: "v1.2".into(),
            },
            Message::FlashDone { code: 0 },
        ];

        for message in messages {
            assert_eq!(Message::decode(&message.encode()).unwrap(), message);
        }
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(Message::decode(&[]).is_err());
        // Unknown tag
        assert!(Message::decode(&[0x7f]).is_err());
        // Erase payload too short
        assert!(Message::decode(&[0x02, 0x00, 0x01]).is_err());
        // Program length byte disagrees with the payload
        assert!(Message::decode(&[0x03, 0x00, 0, 0, 0, 0, 4, 0xaa]).is_err());
    }

    #[test]
    fn subscription_unregisters_on_drop() {
        let link = mock::MockLink::new();

        {
            let sub = Subscription::subscribe(&link, MessageKind::FlashDone);
            link.dispatch(&Message::FlashDone { code: 0 });
            assert_eq!(
                sub.recv_timeout(Duration::from_millis(10)).unwrap(),
                Message::FlashDone { code: 0 }
            );
        }

        // The handler is gone, dispatch is a no-op.
        link.dispatch(&Message::FlashDone { code: 0 });
        assert!(!link.has_handler(MessageKind::FlashDone));
    }
}
