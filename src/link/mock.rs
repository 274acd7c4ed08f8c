//! Scripted in-memory device used by the engine tests
//!
//! The mock records every message the host sends and plays the device's
//! role: it can answer a reset with a bootloader handshake, acknowledge
//! erase and program operations, and reject the Nth flash operation with
//! a configurable status code.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use super::{Handler, Link, Message, MessageKind};
use crate::error::LinkError;

pub(crate) struct MockLink {
    handlers: Mutex<HashMap<MessageKind, Handler>>,
    sent: Mutex<Vec<Message>>,
    handshake_on_reset: AtomicBool,
    handshake_version: Mutex<String>,
    /// 1-based index of the flash operation to fail, with its status code.
    fail_op: Mutex<Option<(usize, u8)>>,
    ops_seen: AtomicUsize,
}

impl MockLink {
    pub fn new() -> Self {
        MockLink {
            handlers: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            handshake_on_reset: AtomicBool::new(true),
            handshake_version: Mutex::new("v1.2".into()),
            fail_op: Mutex::new(None),
            ops_seen: AtomicUsize::new(0),
        }
    }

    /// A device that never answers the reset with a handshake.
    pub fn unresponsive() -> Self {
        let link = Self::new();
        link.handshake_on_reset.store(false, Ordering::SeqCst);
        link
    }

    /// Reject flash operation number `n` (1-based) with `code`.
    pub fn fail_operation(&self, n: usize, code: u8) {
        *self.fail_op.lock().unwrap() = Some((n, code));
    }

    pub fn set_handshake_version(&self, version: &str) {
        *self.handshake_version.lock().unwrap() = version.into();
    }

    /// Deliver a device-originated message to the registered handler.
    pub fn dispatch(&self, message: &Message) {
        let mut handlers = self.handlers.lock().unwrap();
        if let Some(handler) = handlers.get_mut(&message.kind()) {
            handler(message);
        }
    }

    pub fn has_handler(&self, kind: MessageKind) -> bool {
        self.handlers.lock().unwrap().contains_key(&kind)
    }

    /// Everything the host has sent, in order.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    /// Count of sent messages of the given kind.
    pub fn sent_count(&self, kind: MessageKind) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|message| message.kind() == kind)
            .count()
    }
}

impl Link for MockLink {
    fn send(&self, message: Message) -> Result<(), LinkError> {
        self.sent.lock().unwrap().push(message.clone());

        match message {
            Message::Reset => {
                if self.handshake_on_reset.load(Ordering::SeqCst) {
                    let version = self.handshake_version.lock().unwrap().clone();
                    self.dispatch(&Message::Handshake { version });
                }
            }
            Message::EraseSector { .. } | Message::ProgramFlash { .. } => {
                let n = self.ops_seen.fetch_add(1, Ordering::SeqCst) + 1;
                let code = match *self.fail_op.lock().unwrap() {
                    Some((fail_n, code)) if fail_n == n => code,
                    _ => 0,
                };
                self.dispatch(&Message::FlashDone { code });
            }
            _ => {}
        }

        Ok(())
    }

    fn register(&self, kind: MessageKind, handler: Handler) {
        self.handlers.lock().unwrap().insert(kind, handler);
    }

    fn unregister(&self, kind: MessageKind) {
        self.handlers.lock().unwrap().remove(&kind);
    }
}
