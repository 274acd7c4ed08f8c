//! Sector erase and record write engine
//!
//! A [Flasher] is bound to one target's geometry and drives the
//! bootloader's erase and program commands over the link, strictly one
//! outstanding command at a time. Restricted sectors are rejected before
//! any message reaches the device. A failed or unacknowledged operation
//! aborts the write immediately and reports exactly how far it got; the
//! partially written flash is left as-is, recovery is a re-run.

use log::{debug, info};

use crate::{
    bootloader::ProtocolVersion,
    error::{DeviceWriteError, Error, FlashResponseCode, LinkError},
    image_format::FirmwareImage,
    link::{Link, Message, MessageKind, Subscription},
    progress::ProgressCallbacks,
    targets::Target,
};

/// Data bytes per program transfer.
pub const WRITE_CHUNK_SIZE: usize = 128;

/// One planned program transfer, confined to a single sector
#[derive(Clone, Debug, PartialEq, Eq)]
struct WriteOp {
    sector: u32,
    addr: u32,
    data: Vec<u8>,
}

/// Programs one target's flash through the bootloader
///
/// Holds the acknowledgment subscription for its whole lifetime;
/// dropping the value releases it.
pub struct Flasher<'a> {
    link: &'a dyn Link,
    target: Target,
    protocol: ProtocolVersion,
    acks: Subscription<'a>,
}

impl<'a> Flasher<'a> {
    pub fn new(link: &'a dyn Link, target: Target, protocol: ProtocolVersion) -> Self {
        debug!("Flashing the {target} target (bootloader protocol {protocol:?})");

        Flasher {
            link,
            target,
            protocol,
            acks: Subscription::subscribe(link, MessageKind::FlashDone),
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Distinct sector indices touched by `image`, ascending.
    pub fn touched_sectors(&self, image: &FirmwareImage) -> Vec<u32> {
        touched_sectors(self.target, image)
    }

    /// Total number of erase and write operations a
    /// [write_image](Self::write_image) call will perform.
    pub fn operation_count(&self, image: &FirmwareImage, erase: bool) -> usize {
        operation_count(self.target, image, erase)
    }

    /// Erase one sector and block for the device's acknowledgment.
    pub fn erase_sector(&mut self, sector: u32) -> Result<(), Error> {
        let span = self
            .target
            .sector_map()
            .iter()
            .find(|candidate| candidate.index == sector);

        // Both checks happen before any link traffic.
        let span = match span {
            Some(span) if !self.target.is_restricted(sector) => span,
            _ => {
                return Err(Error::ProtectedSector {
                    target: self.target,
                    sector,
                })
            }
        };

        debug!("Erasing {} sector {sector}", self.target);
        self.link.send(Message::EraseSector {
            flash_id: self.target.flash_id(),
            sector,
        })?;

        self.await_ack(MessageKind::EraseSector, sector, span.start)
    }

    /// Write `image` to flash, sector by sector in ascending address
    /// order, erasing each touched sector first unless `erase` is false
    /// (used when an explicit bulk-erase pass already ran).
    ///
    /// `progress` sees `init`, then one strictly increasing `update` per
    /// completed operation from 0 up to exactly
    /// [operation_count](Self::operation_count), then `finish`.
    pub fn write_image(
        &mut self,
        image: &FirmwareImage,
        erase: bool,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let sectors = self.touched_sectors(image);

        // Reject the whole write before anything reaches the device.
        for sector in &sectors {
            if self.target.is_restricted(*sector) {
                return Err(Error::ProtectedSector {
                    target: self.target,
                    sector: *sector,
                });
            }
        }

        let writes = self.plan_writes(image);
        let total = if erase { sectors.len() } else { 0 } + writes.len();

        info!(
            "Writing {} bytes across {} sectors of the {} flash ({total} operations)",
            image.len(),
            sectors.len(),
            self.target
        );

        progress.init(total, true);
        progress.update(0);
        let mut completed = 0;

        for sector in sectors {
            if erase {
                self.erase_sector(sector)?;
                completed += 1;
                progress.update(completed);
            }

            for op in writes.iter().filter(|op| op.sector == sector) {
                self.link.send(Message::ProgramFlash {
                    flash_id: self.target.flash_id(),
                    addr: op.addr,
                    data: op.data.clone(),
                })?;
                self.await_ack(MessageKind::ProgramFlash, op.sector, op.addr)?;

                completed += 1;
                progress.update(completed);
            }
        }

        progress.finish();
        Ok(())
    }

    fn plan_writes(&self, image: &FirmwareImage) -> Vec<WriteOp> {
        plan_writes(self.target, image)
    }

    /// Block for the acknowledgment of the last sent operation.
    fn await_ack(&mut self, command: MessageKind, sector: u32, addr: u32) -> Result<(), Error> {
        match self.acks.recv_timeout(command.ack_timeout()) {
            Ok(Message::FlashDone { code: 0 }) => Ok(()),
            Ok(Message::FlashDone { code }) => Err(DeviceWriteError::new(
                command,
                sector,
                addr,
                FlashResponseCode::from(code),
            )
            .into()),
            Ok(_) | Err(LinkError::Timeout(_)) => {
                Err(DeviceWriteError::new(command, sector, addr, FlashResponseCode::NoAck).into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Distinct sector indices of `target` touched by `image`, ascending.
pub fn touched_sectors(target: Target, image: &FirmwareImage) -> Vec<u32> {
    let mut sectors: Vec<u32> = Vec::new();

    for record in image.records() {
        let mut addr = record.addr;
        while addr < record.end() {
            // The image was validated against the target's range, so
            // every address maps to a sector.
            let sector = match target.sector_containing(addr) {
                Some(sector) => sector,
                None => break,
            };
            if sectors.last() != Some(&sector.index) {
                sectors.push(sector.index);
            }
            addr = sector.range().end;
        }
    }

    sectors.sort_unstable();
    sectors.dedup();
    sectors
}

/// Total number of operations writing `image` takes.
///
/// With `erase` set this counts one erase per distinct non-restricted
/// sector the image touches, plus the program transfers; without it,
/// only the transfers.
pub fn operation_count(target: Target, image: &FirmwareImage, erase: bool) -> usize {
    let erases = if erase {
        touched_sectors(target, image)
            .iter()
            .filter(|sector| !target.is_restricted(**sector))
            .count()
    } else {
        0
    };

    erases + plan_writes(target, image).len()
}

/// Split the image into per-sector transfers of at most
/// [WRITE_CHUNK_SIZE] bytes.
fn plan_writes(target: Target, image: &FirmwareImage) -> Vec<WriteOp> {
    let mut ops = Vec::new();

    for record in image.records() {
        let mut addr = record.addr;
        let mut remaining = record.data.as_slice();

        while !remaining.is_empty() {
            let sector = match target.sector_containing(addr) {
                Some(sector) => sector,
                None => break,
            };

            // Transfers never cross a sector boundary.
            let in_sector = (sector.range().end - addr) as usize;
            let len = remaining.len().min(in_sector).min(WRITE_CHUNK_SIZE);

            ops.push(WriteOp {
                sector: sector.index,
                addr,
                data: remaining[..len].to_vec(),
            });

            addr += len as u32;
            remaining = &remaining[len..];
        }
    }

    ops
}
