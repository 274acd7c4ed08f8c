//! Serial-port transport for the device link
//!
//! Messages are SLIP-framed on the wire. A dedicated reader thread owns
//! the receive side of the port and dispatches every decoded message to
//! the handler registered for its kind; the send side is shared behind a
//! mutex, which is enough because the bootloader protocol only ever has
//! one outstanding host command.

use std::{
    collections::HashMap,
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use log::{debug, warn};
use serialport::{FlowControl, SerialPort};
use slip_codec::{SlipDecoder, SlipError};

use super::{Handler, Link, Message, MessageKind};
use crate::error::{Error, LinkError};

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// How long a blocking read on the port may stall before the reader
/// thread re-checks for shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// A [Link] over a serial port
pub struct SerialLink {
    writer: Mutex<Box<dyn SerialPort>>,
    handlers: Arc<Mutex<HashMap<MessageKind, Handler>>>,
    shutdown: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialLink {
    /// Open `port` at `baud` and start the reader thread.
    pub fn open(port: &str, baud: u32) -> Result<Self, Error> {
        debug!("Opening serial port {port} at {baud} baud");

        let writer = serialport::new(port, baud)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;
        let reader_port = writer.try_clone()?;

        let handlers: Arc<Mutex<HashMap<MessageKind, Handler>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let reader = std::thread::Builder::new()
            .name("navflash-link-reader".into())
            .spawn({
                let handlers = Arc::clone(&handlers);
                let shutdown = Arc::clone(&shutdown);
                move || read_loop(reader_port, handlers, shutdown)
            })
            .map_err(|err| Error::Link(LinkError::from(err)))?;

        Ok(SerialLink {
            writer: Mutex::new(writer),
            handlers,
            shutdown,
            reader: Some(reader),
        })
    }
}

impl Link for SerialLink {
    fn send(&self, message: Message) -> Result<(), LinkError> {
        debug!("Sending message: {message:?}");

        let frame = message.encode();
        let mut writer = self.writer.lock().unwrap();

        let mut encoded = Vec::with_capacity(frame.len() + 2);
        encoded.push(END);
        for byte in &frame {
            match *byte {
                END => encoded.extend_from_slice(&[ESC, ESC_END]),
                ESC => encoded.extend_from_slice(&[ESC, ESC_ESC]),
                _ => encoded.push(*byte),
            }
        }
        encoded.push(END);

        writer.write_all(&encoded)?;
        writer.flush()?;

        Ok(())
    }

    fn register(&self, kind: MessageKind, handler: Handler) {
        self.handlers.lock().unwrap().insert(kind, handler);
    }

    fn unregister(&self, kind: MessageKind) {
        self.handlers.lock().unwrap().remove(&kind);
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn read_loop(
    mut port: Box<dyn SerialPort>,
    handlers: Arc<Mutex<HashMap<MessageKind, Handler>>>,
    shutdown: Arc<AtomicBool>,
) {
    let mut decoder = SlipDecoder::new();

    while !shutdown.load(Ordering::SeqCst) {
        let mut frame = Vec::new();
        match decoder.decode(&mut port, &mut frame) {
            Ok(_) => match Message::decode(&frame) {
                Ok(message) => {
                    debug!("Received message: {message:?}");
                    let mut handlers = handlers.lock().unwrap();
                    if let Some(handler) = handlers.get_mut(&message.kind()) {
                        handler(&message);
                    }
                }
                Err(err) => warn!("Discarding undecodable frame: {err}"),
            },
            Err(SlipError::ReadError(err)) if err.kind() == std::io::ErrorKind::TimedOut => {
                // Idle line; check for shutdown and keep listening.
            }
            Err(SlipError::EndOfStream) => {
                warn!("Serial port closed, stopping link reader");
                break;
            }
            Err(err) => {
                warn!("SLIP decode error: {:?}", LinkError::from(err));
                decoder = SlipDecoder::new();
            }
        }
    }
}
