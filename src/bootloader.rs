//! Reset the device and wait for its bootloader to report in
//!
//! Entering bootloader mode is the one part of an update that may need a
//! human: a device whose application firmware is corrupt will not react
//! to the reset message, and the operator has to press the physical
//! reset button. The handshake wait therefore retries indefinitely in
//! one-second polls instead of failing, until either the handshake
//! arrives or the caller cancels. Cancelling here is the only way to
//! abort an update with zero side effects on the device.

use std::time::Duration;

use log::{debug, info, warn};

use crate::{
    error::Error,
    link::{Link, Message, MessageKind, Subscription},
    updater::CancelToken,
};

/// Bound on a single handshake poll.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Bootloader protocol revision reported in the handshake
///
/// Parsed from the handshake's version string. The current wire protocol
/// has a single revision, so the version is carried and logged but gates
/// no behavior yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion { major: 1, minor: 0 }
    }
}

impl ProtocolVersion {
    /// Parse the leading `major.minor` out of a version string like
    /// `v1.2` or `1.2.3-dirty`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let raw = raw.strip_prefix(['v', 'V']).unwrap_or(raw);

        let mut parts = raw.split(['.', '-']);
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|minor| minor.parse().ok()).unwrap_or(0);

        Some(ProtocolVersion { major, minor })
    }
}

/// Resets the device and performs the bootloader handshake
///
/// Holds the handshake subscription for its whole lifetime; dropping the
/// value releases it.
pub struct Bootloader<'a> {
    link: &'a dyn Link,
    handshakes: Subscription<'a>,
    version: Option<String>,
}

impl<'a> Bootloader<'a> {
    pub fn new(link: &'a dyn Link) -> Self {
        Bootloader {
            link,
            handshakes: Subscription::subscribe(link, MessageKind::Handshake),
            version: None,
        }
    }

    /// Send the reset command so a running application re-enters its
    /// bootloader. A device already sitting in the bootloader ignores it.
    pub fn reset(&mut self) -> Result<(), Error> {
        // Stale handshakes from an earlier reset must not satisfy this
        // round's wait.
        self.handshakes.drain();
        self.version = None;
        self.link.send(Message::Reset)?;

        Ok(())
    }

    /// Wait up to `timeout` for one bootloader handshake, capturing the
    /// reported version on success.
    pub fn poll_handshake(&mut self, timeout: Duration) -> Result<(), Error> {
        match self.handshakes.recv_timeout(timeout) {
            Ok(Message::Handshake { version }) => {
                debug!("Bootloader handshake received, version {version}");
                self.version = Some(version);
                Ok(())
            }
            Ok(message) => {
                warn!("Unexpected message while waiting for handshake: {message:?}");
                Err(Error::HandshakeTimeout)
            }
            Err(crate::error::LinkError::Timeout(_)) => Err(Error::HandshakeTimeout),
            Err(err) => Err(err.into()),
        }
    }

    /// Reset the device and poll for the handshake until it arrives or
    /// `cancel` fires.
    ///
    /// `on_retry` is invoked with the attempt number after every timed-out
    /// poll, so the caller can prompt the operator to press the reset
    /// button.
    pub fn wait_for_handshake(
        &mut self,
        cancel: Option<&CancelToken>,
        mut on_retry: impl FnMut(usize),
    ) -> Result<(), Error> {
        self.reset()?;
        info!("Waiting for the bootloader handshake");

        let mut attempts = 0;
        loop {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(Error::Cancelled);
            }

            match self.poll_handshake(HANDSHAKE_TIMEOUT) {
                Ok(()) => {
                    info!(
                        "Device bootloader version: {}",
                        self.version.as_deref().unwrap_or("unknown")
                    );
                    return Ok(());
                }
                Err(Error::HandshakeTimeout) => {
                    attempts += 1;
                    warn!("No handshake yet; press the reset button on the device");
                    on_retry(attempts);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The version string reported in the handshake, once received.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// The protocol revision parsed from the reported version.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
            .as_deref()
            .and_then(ProtocolVersion::parse)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::MockLink;

    #[test]
    fn handshake_after_reset() {
        let link = MockLink::new();
        link.set_handshake_version("v2.1");

        let mut boot = Bootloader::new(&link);
        boot.wait_for_handshake(None, |_| {}).unwrap();

        assert_eq!(boot.version(), Some("v2.1"));
        assert_eq!(
            boot.protocol_version(),
            ProtocolVersion { major: 2, minor: 1 }
        );
        assert_eq!(link.sent(), vec![Message::Reset]);
    }

    #[test]
    fn poll_times_out_on_a_silent_device() {
        let link = MockLink::unresponsive();

        let mut boot = Bootloader::new(&link);
        boot.reset().unwrap();

        assert!(matches!(
            boot.poll_handshake(Duration::from_millis(20)),
            Err(Error::HandshakeTimeout)
        ));
        assert!(boot.version().is_none());
    }

    #[test]
    fn cancel_aborts_the_wait() {
        let link = MockLink::unresponsive();
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut boot = Bootloader::new(&link);
        let result = boot.wait_for_handshake(Some(&cancel), |_| {});

        assert!(matches!(result, Err(Error::Cancelled)));
        // Only the reset went out; cancelling before the handshake has
        // zero destructive side effects.
        assert_eq!(link.sent(), vec![Message::Reset]);
    }

    #[test]
    fn parses_protocol_versions() {
        assert_eq!(
            ProtocolVersion::parse("v1.2"),
            Some(ProtocolVersion { major: 1, minor: 2 })
        );
        assert_eq!(
            ProtocolVersion::parse("2.0.3-dirty"),
            Some(ProtocolVersion { major: 2, minor: 0 })
        );
        assert_eq!(
            ProtocolVersion::parse("3"),
            Some(ProtocolVersion { major: 3, minor: 0 })
        );
        assert_eq!(ProtocolVersion::parse("bootloader"), None);
    }
}
