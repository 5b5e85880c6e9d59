//! Polled PIO driver for ATA drives.
//!
//! Transfers go one 16-bit word at a time through the data port, with BSY/DRQ polling between
//! sectors. Writes are followed by a cache-flush command, so that a returned write is actually
//! on the platter.

use crate::drivers::generics::dev_disk::{DiskDevice, SECTOR_SIZE};
use crate::drivers::ide::ata_command::AtaCommand;
use crate::drivers::ide::AtaError;
use crate::errors::{CanFail, IOError};
use crate::io::{inb, inw, io_delay, outb, outw, IOPort};
use modular_bitfield::bitfield;

/// LBA28 addressing transfers at most 256 sectors per command (a count of 0 means 256).
const MAX_SECTORS_PER_COMMAND: u32 = 256;

/// Upper bound on status polling iterations before declaring the device gone.
const BSY_TIMEOUT: u32 = 1_000_000;

/// ATA status register, read from `io_base + 7`.
#[bitfield]
#[derive(Clone, Copy, Debug)]
#[repr(u8)]
pub(super) struct StatusRegister {
    /// An error occurred; details in the error register.
    pub err: bool,

    #[skip]
    __: bool,
    #[skip]
    __: bool,

    /// Device is ready to transfer a word of data.
    pub drq: bool,

    #[skip]
    __: bool,

    /// Device fault.
    pub df: bool,

    /// Device is ready to accept commands.
    pub rdy: bool,

    /// Device is busy; no other bit is valid while set.
    pub bsy: bool,
}

/// A single ATA drive on one channel, driven in polled PIO mode.
pub struct AtaDrive {
    io_base: IOPort,
    ctrl_base: IOPort,
    is_slave: bool,
    max_lba: u32,
}

impl AtaDrive {
    /// Probes the given channel/position for a drive and identifies it.
    ///
    /// # Errors
    ///
    /// Fails with [`AtaError::DriveNotPresent`] when nothing answers on the channel.
    pub fn init(io_base: IOPort, ctrl_base: IOPort, is_slave: bool) -> Result<Self, AtaError> {
        let mut drive = Self {
            io_base,
            ctrl_base,
            is_slave,
            max_lba: 0,
        };

        let status = inb(io_base.offset(7));
        if status == 0xFF || status == 0 {
            return Err(AtaError::DriveNotPresent);
        }

        drive.identify()?;

        crate::info!(
            "ata",
            "drive on channel {:#x} ({}): {} sectors",
            u16::from(io_base),
            if is_slave { "slave" } else { "master" },
            drive.max_lba
        );

        Ok(drive)
    }

    fn status(&self) -> StatusRegister {
        StatusRegister::from(inb(self.io_base.offset(7)))
    }

    /// Reads the alternate status register, which does not acknowledge interrupts.
    fn alternate_status(&self) -> StatusRegister {
        StatusRegister::from(inb(self.ctrl_base))
    }

    /// 400ns settle delay: four alternate status reads.
    fn settle(&self) {
        for _ in 0..4 {
            let _ = self.alternate_status();
        }
    }

    fn wait_not_busy(&self) -> CanFail<AtaError> {
        for _ in 0..BSY_TIMEOUT {
            let status = self.status();
            if !status.bsy() {
                if status.err() || status.df() {
                    return Err(AtaError::DeviceError);
                }
                return Ok(());
            }
        }

        Err(AtaError::Timeout)
    }

    fn wait_data_request(&self) -> CanFail<AtaError> {
        for _ in 0..BSY_TIMEOUT {
            let status = self.status();
            if status.err() || status.df() {
                return Err(AtaError::DeviceError);
            }
            if !status.bsy() && status.drq() {
                return Ok(());
            }
        }

        Err(AtaError::Timeout)
    }

    /// Selects this drive and programs an LBA28 transfer.
    fn setup_transfer(&self, lba: u32, count: u16) {
        let select = 0xE0 | (u8::from(self.is_slave) << 4) | ((lba >> 24) & 0x0F) as u8;

        outb(self.io_base.offset(6), select);
        io_delay();
        outb(self.io_base.offset(2), (count & 0xFF) as u8);
        outb(self.io_base.offset(3), (lba & 0xFF) as u8);
        outb(self.io_base.offset(4), ((lba >> 8) & 0xFF) as u8);
        outb(self.io_base.offset(5), ((lba >> 16) & 0xFF) as u8);
    }

    fn send_command(&self, command: AtaCommand) {
        outb(self.io_base.offset(7), command.discriminant());
    }

    fn identify(&mut self) -> CanFail<AtaError> {
        self.setup_transfer(0, 0);
        self.send_command(AtaCommand::AtaIdentifyDevice);
        self.wait_data_request()?;

        let mut identify = [0u16; 256];
        for word in &mut identify {
            *word = inw(self.io_base);
        }

        // Words 60-61 hold the total number of LBA28-addressable sectors.
        self.max_lba = u32::from(identify[60]) | (u32::from(identify[61]) << 16);
        if self.max_lba == 0 {
            return Err(AtaError::InvalidCommand);
        }

        Ok(())
    }

    /// Reads up to 256 sectors in one ATA command.
    fn read_chunk(&mut self, lba: u32, count: u16, buffer: &mut [u8]) -> CanFail<AtaError> {
        self.wait_not_busy()?;
        self.setup_transfer(lba, count);
        self.send_command(AtaCommand::AtaReadSectors);

        let sectors = if count == 0 { 256 } else { usize::from(count) };
        for sector in 0..sectors {
            self.wait_data_request()?;

            for word_idx in 0..SECTOR_SIZE / 2 {
                let word = inw(self.io_base);
                let offset = sector * SECTOR_SIZE + word_idx * 2;
                buffer[offset] = (word & 0xFF) as u8;
                buffer[offset + 1] = (word >> 8) as u8;
            }
            self.settle();
        }

        Ok(())
    }

    /// Writes up to 256 sectors in one ATA command, then flushes the device cache.
    fn write_chunk(&mut self, lba: u32, count: u16, buffer: &[u8]) -> CanFail<AtaError> {
        self.wait_not_busy()?;
        self.setup_transfer(lba, count);
        self.send_command(AtaCommand::AtaWriteSectors);

        let sectors = if count == 0 { 256 } else { usize::from(count) };
        for sector in 0..sectors {
            self.wait_data_request()?;

            for word_idx in 0..SECTOR_SIZE / 2 {
                let offset = sector * SECTOR_SIZE + word_idx * 2;
                let word = u16::from(buffer[offset]) | (u16::from(buffer[offset + 1]) << 8);
                outw(self.io_base, word);
            }
            self.settle();
        }

        self.send_command(AtaCommand::AtaFlushCache);
        self.wait_not_busy()
    }
}

impl DiskDevice for AtaDrive {
    fn read(&mut self, start_lba: u32, sectors_count: u16, buffer: &mut [u8]) -> CanFail<IOError> {
        let total = u32::from(sectors_count);
        if buffer.len() < total as usize * SECTOR_SIZE || start_lba + total > self.max_lba {
            return Err(IOError::InvalidCommand);
        }

        let mut done = 0;
        while done < total {
            let chunk = (total - done).min(MAX_SECTORS_PER_COMMAND);
            let offset = done as usize * SECTOR_SIZE;
            self.read_chunk(
                start_lba + done,
                (chunk % MAX_SECTORS_PER_COMMAND) as u16,
                &mut buffer[offset..offset + chunk as usize * SECTOR_SIZE],
            )
            .map_err(IOError::from)?;
            done += chunk;
        }

        Ok(())
    }

    fn write(&mut self, start_lba: u32, sectors_count: u16, buffer: &[u8]) -> CanFail<IOError> {
        let total = u32::from(sectors_count);
        if buffer.len() < total as usize * SECTOR_SIZE || start_lba + total > self.max_lba {
            return Err(IOError::InvalidCommand);
        }

        let mut done = 0;
        while done < total {
            let chunk = (total - done).min(MAX_SECTORS_PER_COMMAND);
            let offset = done as usize * SECTOR_SIZE;
            self.write_chunk(
                start_lba + done,
                (chunk % MAX_SECTORS_PER_COMMAND) as u16,
                &buffer[offset..offset + chunk as usize * SECTOR_SIZE],
            )
            .map_err(IOError::from)?;
            done += chunk;
        }

        Ok(())
    }

    fn max_sector(&self) -> u32 {
        self.max_lba
    }
}
