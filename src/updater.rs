//! Update session orchestration
//!
//! The [Updater] owns a single session slot: requesting an update while
//! one is running is rejected outright, never queued. A granted request
//! spawns a dedicated worker thread that sequences the session phases
//! against the device and reports back through an event channel, so no
//! front end ever blocks on the hardware. Cancellation is honored only
//! while the session is still handshaking; once the first destructive
//! command has gone out, the session runs to completion or hard failure.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread::JoinHandle,
};

use log::{info, warn};
use strum::Display;

use crate::{
    bootloader::Bootloader,
    error::Error,
    flasher::Flasher,
    image_format::FirmwareImage,
    link::{Link, Message},
    progress::ProgressCallbacks,
    targets::Target,
    version::{VersionCmp, VersionSnapshot},
};

/// Which target(s) a session updates
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum UpdatePlan {
    /// Application microcontroller only.
    Application,
    /// Coprocessor only.
    Coprocessor,
    /// Application first, then the coprocessor if its version is behind.
    Both,
}

/// Session tuning knobs
#[derive(Clone, Copy, Debug)]
pub struct UpdateOptions {
    /// Erase every non-restricted application sector in a dedicated pass
    /// before flashing (recommended; clears stale data outside the new
    /// image).
    pub erase_application: bool,
    /// Skip a coprocessor-only update when its installed version already
    /// equals the available one.
    pub check_versions: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        UpdateOptions {
            erase_application: true,
            check_versions: true,
        }
    }
}

/// Phases of one update session, in order
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum UpdatePhase {
    NotStarted,
    /// Bulk-erasing the application flash.
    Erasing,
    /// Waiting for the bootloader handshake.
    Handshaking,
    /// Writing image records.
    Flashing,
    /// Releasing resources and jumping back to the application.
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

/// Terminal result of a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Completed { summary: String },
    Failed { summary: String },
    Cancelled,
}

impl UpdateOutcome {
    pub fn phase(&self) -> UpdatePhase {
        match self {
            UpdateOutcome::Completed { .. } => UpdatePhase::Completed,
            UpdateOutcome::Failed { .. } => UpdatePhase::Failed,
            UpdateOutcome::Cancelled => UpdatePhase::Cancelled,
        }
    }
}

/// Asynchronous notifications from the worker to the front end
#[derive(Clone, Debug)]
pub enum UpdateEvent {
    Phase(UpdatePhase),
    Progress {
        completed: usize,
        total: usize,
        pulsed: bool,
    },
    /// Operator-facing message, e.g. the reset-button prompt.
    Notice(String),
    /// Always the last event of a session.
    Outcome(UpdateOutcome),
}

/// Requests cancellation of a session's handshake wait
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Firmware images for the targets a plan covers
#[derive(Clone, Debug, Default)]
pub struct UpdateImages {
    pub application: Option<FirmwareImage>,
    pub coprocessor: Option<FirmwareImage>,
}

/// Handle to a running session
pub struct UpdateHandle {
    events: Receiver<UpdateEvent>,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl UpdateHandle {
    /// The event stream; ends with [UpdateEvent::Outcome].
    pub fn events(&self) -> &Receiver<UpdateEvent> {
        &self.events
    }

    /// Token that aborts the session while it is still handshaking.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until the session ends, discarding intermediate events.
    pub fn wait(mut self) -> UpdateOutcome {
        let mut outcome = None;
        for event in self.events.iter() {
            if let UpdateEvent::Outcome(result) = event {
                outcome = Some(result);
            }
        }

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        // The worker always emits an outcome; a vanished worker is a failure.
        outcome.unwrap_or(UpdateOutcome::Failed {
            summary: "update worker exited without reporting an outcome".into(),
        })
    }
}

impl Drop for UpdateHandle {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            // A dropped handle must not block on a session still waiting
            // for its handshake; the token is ignored once destructive
            // work has started.
            self.cancel.cancel();
            let _ = worker.join();
        }
    }
}

/// Single-slot update supervisor for one device link
pub struct Updater<L: Link + 'static> {
    link: Arc<L>,
    options: UpdateOptions,
    active: Arc<AtomicBool>,
}

impl<L: Link + 'static> Updater<L> {
    pub fn new(link: Arc<L>, options: UpdateOptions) -> Self {
        Updater {
            link,
            options,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start an update session on the worker thread.
    ///
    /// Fails with [Error::UpdateInProgress] while a session is active and
    /// with [Error::MissingImage] when the plan lacks an image, both
    /// before anything is sent to the device.
    pub fn request_update(
        &self,
        plan: UpdatePlan,
        images: UpdateImages,
        versions: VersionSnapshot,
    ) -> Result<UpdateHandle, Error> {
        match plan {
            UpdatePlan::Application | UpdatePlan::Both if images.application.is_none() => {
                return Err(Error::MissingImage(Target::Application));
            }
            UpdatePlan::Coprocessor | UpdatePlan::Both if images.coprocessor.is_none() => {
                return Err(Error::MissingImage(Target::Coprocessor));
            }
            _ => {}
        }

        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Rejecting update request: a session is already in progress");
            return Err(Error::UpdateInProgress);
        }

        let (events_tx, events_rx) = mpsc::channel();
        let cancel = CancelToken::new();

        let worker = {
            let link = Arc::clone(&self.link);
            let options = self.options;
            let cancel = cancel.clone();
            let slot = SlotGuard(Arc::clone(&self.active));

            std::thread::Builder::new()
                .name("navflash-updater".into())
                .spawn(move || {
                    let _slot = slot;
                    let session = Session {
                        link: link.as_ref(),
                        options,
                        plan,
                        images,
                        versions,
                        events: events_tx,
                        cancel,
                        destructive: false,
                    };
                    session.run();
                })
                .map_err(|err| Error::Link(crate::error::LinkError::from(err)))?
        };

        Ok(UpdateHandle {
            events: events_rx,
            cancel,
            worker: Some(worker),
        })
    }
}

/// Releases the session slot on every worker exit path.
struct SlotGuard(Arc<AtomicBool>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Forwards flasher progress into the event channel.
struct EventProgress<'a> {
    events: &'a Sender<UpdateEvent>,
    total: usize,
    pulsed: bool,
}

impl<'a> EventProgress<'a> {
    fn new(events: &'a Sender<UpdateEvent>) -> Self {
        EventProgress {
            events,
            total: 0,
            pulsed: false,
        }
    }
}

impl ProgressCallbacks for EventProgress<'_> {
    fn init(&mut self, total: usize, pulsed: bool) {
        self.total = total;
        self.pulsed = pulsed;
    }

    fn update(&mut self, current: usize) {
        let _ = self.events.send(UpdateEvent::Progress {
            completed: current,
            total: self.total,
            pulsed: self.pulsed,
        });
    }

    fn finish(&mut self) {}
}

/// One in-flight update session, running on the worker thread
struct Session<'a> {
    link: &'a dyn Link,
    options: UpdateOptions,
    plan: UpdatePlan,
    images: UpdateImages,
    versions: VersionSnapshot,
    events: Sender<UpdateEvent>,
    cancel: CancelToken,
    /// Set before the first erase or write goes out; cancellation is
    /// ignored from then on.
    destructive: bool,
}

impl<'a> Session<'a> {
    fn run(mut self) {
        let outcome = match self.execute() {
            Ok(summary) => UpdateOutcome::Completed { summary },
            Err(Error::Cancelled) => UpdateOutcome::Cancelled,
            Err(err) => UpdateOutcome::Failed {
                summary: format!("{err}"),
            },
        };

        match &outcome {
            UpdateOutcome::Completed { summary } => info!("{summary}"),
            UpdateOutcome::Failed { summary } => warn!("Firmware update failed: {summary}"),
            UpdateOutcome::Cancelled => info!("Firmware update cancelled"),
        }

        self.set_phase(outcome.phase());
        let _ = self.events.send(UpdateEvent::Outcome(outcome));
    }

    fn execute(&mut self) -> Result<String, Error> {
        let jump = match self.plan {
            UpdatePlan::Application => {
                self.update_application()?;
                true
            }
            UpdatePlan::Coprocessor => self.update_coprocessor(self.options.check_versions)?,
            UpdatePlan::Both => {
                self.update_application()?;
                let coprocessor_updated = self.update_coprocessor(true)?;
                // The application was flashed, so the device must jump
                // back regardless of the coprocessor outcome.
                let _ = coprocessor_updated;
                true
            }
        };

        self.set_phase(UpdatePhase::Finalizing);
        if jump {
            self.link.send(Message::JumpToApp)?;
            Ok("Firmware update finished".into())
        } else {
            Ok("Coprocessor firmware is already up to date, nothing to do".into())
        }
    }

    /// Application sequence: optional bulk-erase pass, handshake, write.
    fn update_application(&mut self) -> Result<(), Error> {
        // Presence was validated before the session was admitted.
        let image = self
            .images
            .application
            .clone()
            .ok_or(Error::MissingImage(Target::Application))?;

        if self.options.erase_application {
            self.set_phase(UpdatePhase::Erasing);
            info!("Erasing the application flash");

            // The device must be in bootloader mode before the first
            // erase, so this pass performs its own handshake.
            let boot = self.handshake()?;
            let mut flasher =
                Flasher::new(self.link, Target::Application, boot.protocol_version());

            let sectors: Vec<u32> = Target::Application
                .sector_map()
                .iter()
                .map(|sector| sector.index)
                .filter(|sector| !Target::Application.is_restricted(*sector))
                .collect();

            let mut progress = EventProgress::new(&self.events);
            progress.init(sectors.len(), false);
            progress.update(0);

            self.destructive = true;
            for (i, sector) in sectors.iter().enumerate() {
                flasher.erase_sector(*sector)?;
                progress.update(i + 1);
            }
            progress.finish();

            drop(flasher);
            drop(boot);
        }

        self.set_phase(UpdatePhase::Handshaking);
        let boot = self.handshake()?;

        self.set_phase(UpdatePhase::Flashing);
        info!("Updating the application firmware");
        let mut flasher = Flasher::new(self.link, Target::Application, boot.protocol_version());
        self.destructive = true;

        let mut progress = EventProgress::new(&self.events);
        // Sectors already erased by the bulk pass are not erased again.
        flasher.write_image(&image, !self.options.erase_application, &mut progress)?;

        Ok(())
    }

    /// Coprocessor sequence; returns whether it was actually flashed.
    fn update_coprocessor(&mut self, check_versions: bool) -> Result<bool, Error> {
        let image = self
            .images
            .coprocessor
            .clone()
            .ok_or(Error::MissingImage(Target::Coprocessor))?;

        if check_versions && self.versions.coprocessor.comparison() == VersionCmp::Equal {
            let notice = format!(
                "Coprocessor firmware {} is already the latest version, not updating",
                self.versions
                    .coprocessor
                    .installed
                    .as_deref()
                    .unwrap_or_default()
            );
            info!("{notice}");
            let _ = self.events.send(UpdateEvent::Notice(notice));
            return Ok(false);
        }

        self.set_phase(UpdatePhase::Handshaking);
        let boot = self.handshake()?;

        self.set_phase(UpdatePhase::Flashing);
        info!("Updating the coprocessor firmware");
        let mut flasher = Flasher::new(self.link, Target::Coprocessor, boot.protocol_version());
        self.destructive = true;

        let mut progress = EventProgress::new(&self.events);
        // Coprocessor writes always erase each sector as they go.
        flasher.write_image(&image, true, &mut progress)?;

        Ok(true)
    }

    /// Reset and wait for the bootloader, prompting the operator on each
    /// timed-out poll. Cancellation is honored only while nothing
    /// destructive has been sent yet.
    fn handshake(&self) -> Result<Bootloader<'a>, Error> {
        let mut boot = Bootloader::new(self.link);
        let cancel = (!self.destructive).then_some(&self.cancel);

        let events = &self.events;
        boot.wait_for_handshake(cancel, |attempt| {
            if attempt == 1 {
                let _ = events.send(UpdateEvent::Notice(
                    "No response from the device; press its reset button to enter the bootloader"
                        .into(),
                ));
            }
        })?;

        Ok(boot)
    }

    fn set_phase(&self, phase: UpdatePhase) {
        let _ = self.events.send(UpdateEvent::Phase(phase));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        image_format::FirmwareImage,
        link::{mock::MockLink, MessageKind},
        targets::Target,
        version::VersionPair,
    };

    fn coprocessor_image() -> FirmwareImage {
        FirmwareImage::parse(":0400000001020304F2\n:00000001FF\n", Target::Coprocessor).unwrap()
    }

    fn application_image() -> FirmwareImage {
        // 4 bytes in sector 1 at 0x0800_4000.
        let text = ":020000040800F2\n:04400000AABBCCDDAE\n:00000001FF\n";
        FirmwareImage::parse(text, Target::Application).unwrap()
    }

    fn updater(link: &Arc<MockLink>, options: UpdateOptions) -> Updater<MockLink> {
        Updater::new(Arc::clone(link), options)
    }

    fn snapshot(installed_cop: &str, available_cop: &str) -> VersionSnapshot {
        VersionSnapshot {
            coprocessor: VersionPair::new(
                Some(installed_cop.into()),
                Some(available_cop.into()),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_concurrent_sessions() {
        let link = Arc::new(MockLink::unresponsive());
        let updater = updater(&link, UpdateOptions::default());

        let images = UpdateImages {
            coprocessor: Some(coprocessor_image()),
            ..Default::default()
        };

        let first = updater
            .request_update(
                UpdatePlan::Coprocessor,
                images.clone(),
                snapshot("1.0", "2.0"),
            )
            .unwrap();

        // The slot is taken; a second request is rejected, not queued.
        assert!(matches!(
            updater.request_update(UpdatePlan::Coprocessor, images, snapshot("1.0", "2.0")),
            Err(Error::UpdateInProgress)
        ));

        first.cancel();
        assert_eq!(first.wait(), UpdateOutcome::Cancelled);
    }

    #[test]
    fn missing_image_is_rejected_before_any_device_traffic() {
        let link = Arc::new(MockLink::new());
        let updater = updater(&link, UpdateOptions::default());

        assert!(matches!(
            updater.request_update(
                UpdatePlan::Application,
                UpdateImages::default(),
                VersionSnapshot::default(),
            ),
            Err(Error::MissingImage(Target::Application))
        ));
        assert!(link.sent().is_empty());
    }

    #[test]
    fn silent_device_keeps_session_handshaking_until_cancelled() {
        let link = Arc::new(MockLink::unresponsive());
        let updater = updater(&link, UpdateOptions::default());

        let handle = updater
            .request_update(
                UpdatePlan::Coprocessor,
                UpdateImages {
                    coprocessor: Some(coprocessor_image()),
                    ..Default::default()
                },
                snapshot("1.0", "2.0"),
            )
            .unwrap();

        // Give the worker a couple of poll rounds.
        std::thread::sleep(Duration::from_millis(2200));

        assert_eq!(link.sent_count(MessageKind::EraseSector), 0);
        assert_eq!(link.sent_count(MessageKind::ProgramFlash), 0);

        handle.cancel();
        assert_eq!(handle.wait(), UpdateOutcome::Cancelled);
        assert_eq!(link.sent_count(MessageKind::JumpToApp), 0);
    }

    #[test]
    fn dropping_a_handle_aborts_a_pending_handshake() {
        let link = Arc::new(MockLink::unresponsive());
        let updater = updater(&link, UpdateOptions::default());

        let images = UpdateImages {
            coprocessor: Some(coprocessor_image()),
            ..Default::default()
        };

        let handle = updater
            .request_update(
                UpdatePlan::Coprocessor,
                images.clone(),
                snapshot("1.0", "2.0"),
            )
            .unwrap();

        // Must return instead of blocking on the handshake retry loop.
        drop(handle);

        // The worker was cancelled before anything destructive went out,
        // and the session slot is free again.
        assert_eq!(link.sent_count(MessageKind::EraseSector), 0);
        assert_eq!(link.sent_count(MessageKind::ProgramFlash), 0);
        assert_eq!(link.sent_count(MessageKind::JumpToApp), 0);
        assert!(updater
            .request_update(UpdatePlan::Coprocessor, images, snapshot("1.0", "2.0"))
            .is_ok());
    }

    #[test]
    fn up_to_date_coprocessor_is_skipped() {
        let link = Arc::new(MockLink::new());
        let updater = updater(&link, UpdateOptions::default());

        let outcome = updater
            .request_update(
                UpdatePlan::Coprocessor,
                UpdateImages {
                    coprocessor: Some(coprocessor_image()),
                    ..Default::default()
                },
                snapshot("1.2.0", "1.2.0"),
            )
            .unwrap()
            .wait();

        match outcome {
            UpdateOutcome::Completed { summary } => {
                assert!(summary.contains("already up to date"), "{summary}");
            }
            other => panic!("expected completion, got {other:?}"),
        }

        // Skipping means zero device mutation and no jump.
        assert_eq!(link.sent_count(MessageKind::EraseSector), 0);
        assert_eq!(link.sent_count(MessageKind::ProgramFlash), 0);
        assert_eq!(link.sent_count(MessageKind::JumpToApp), 0);
    }

    #[test]
    fn outdated_coprocessor_is_flashed_and_jumped() {
        let link = Arc::new(MockLink::new());
        let updater = updater(&link, UpdateOptions::default());

        let outcome = updater
            .request_update(
                UpdatePlan::Coprocessor,
                UpdateImages {
                    coprocessor: Some(coprocessor_image()),
                    ..Default::default()
                },
                snapshot("1.0.0", "1.2.0"),
            )
            .unwrap()
            .wait();

        assert!(matches!(outcome, UpdateOutcome::Completed { .. }));
        assert_eq!(link.sent_count(MessageKind::EraseSector), 1);
        assert_eq!(link.sent_count(MessageKind::ProgramFlash), 1);
        assert_eq!(link.sent_count(MessageKind::JumpToApp), 1);
    }

    #[test]
    fn application_update_erases_then_flashes() {
        let link = Arc::new(MockLink::new());
        let updater = updater(&link, UpdateOptions::default());

        let outcome = updater
            .request_update(
                UpdatePlan::Application,
                UpdateImages {
                    application: Some(application_image()),
                    ..Default::default()
                },
                VersionSnapshot::default(),
            )
            .unwrap()
            .wait();

        assert!(matches!(outcome, UpdateOutcome::Completed { .. }));
        // Bulk pass erased all 11 non-restricted sectors; the write pass
        // added no further erases.
        assert_eq!(link.sent_count(MessageKind::EraseSector), 11);
        assert_eq!(link.sent_count(MessageKind::ProgramFlash), 1);
        assert_eq!(link.sent_count(MessageKind::JumpToApp), 1);
        // One handshake reset per pass.
        assert_eq!(link.sent_count(MessageKind::Reset), 2);
    }

    #[test]
    fn device_rejection_fails_the_session_without_jump() {
        let link = Arc::new(MockLink::new());
        // Fail the 3rd flash operation.
        link.fail_operation(3, 0x03);

        let options = UpdateOptions {
            erase_application: false,
            ..Default::default()
        };
        let updater = updater(&link, options);

        // 300 bytes at 0x0800_4000: erase + 3 program chunks planned.
        let mut text = String::from(":020000040800F2\n");
        for row in 0..2 {
            let offset = 0x4000 + row * 0x96;
            let data = vec![0x5a; 0x96];
            let mut bytes = vec![data.len() as u8, (offset >> 8) as u8, offset as u8, 0x00];
            bytes.extend_from_slice(&data);
            let sum: u8 = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
            bytes.push(sum.wrapping_neg());
            text.push(':');
            for byte in bytes {
                text.push_str(&format!("{byte:02X}"));
            }
            text.push('\n');
        }
        text.push_str(":00000001FF\n");
        let image = FirmwareImage::parse(&text, Target::Application).unwrap();

        let handle = updater
            .request_update(
                UpdatePlan::Application,
                UpdateImages {
                    application: Some(image),
                    ..Default::default()
                },
                VersionSnapshot::default(),
            )
            .unwrap();

        let mut progress_updates = Vec::new();
        let mut outcome = None;
        for event in handle.events().iter() {
            match event {
                UpdateEvent::Progress { completed, .. } => progress_updates.push(completed),
                UpdateEvent::Outcome(result) => outcome = Some(result),
                _ => {}
            }
        }

        match outcome {
            Some(UpdateOutcome::Failed { summary }) => {
                assert!(summary.contains("sector 1"), "{summary}");
            }
            other => panic!("expected failure, got {other:?}"),
        }

        // Erase + 2 successful writes reported, then the hard stop.
        assert_eq!(progress_updates, vec![0, 1, 2]);
        assert_eq!(link.sent_count(MessageKind::JumpToApp), 0);
    }

    #[test]
    fn both_plan_updates_application_then_checks_coprocessor() {
        let link = Arc::new(MockLink::new());
        let options = UpdateOptions {
            erase_application: false,
            ..Default::default()
        };
        let updater = updater(&link, options);

        let outcome = updater
            .request_update(
                UpdatePlan::Both,
                UpdateImages {
                    application: Some(application_image()),
                    coprocessor: Some(coprocessor_image()),
                },
                snapshot("1.2.0", "1.2.0"),
            )
            .unwrap()
            .wait();

        assert!(matches!(outcome, UpdateOutcome::Completed { .. }));
        // The application write erased its one touched sector; the
        // up-to-date coprocessor was skipped; the jump still happens
        // because the application was flashed.
        assert_eq!(link.sent_count(MessageKind::EraseSector), 1);
        assert_eq!(link.sent_count(MessageKind::ProgramFlash), 1);
        assert_eq!(link.sent_count(MessageKind::JumpToApp), 1);
    }
}
