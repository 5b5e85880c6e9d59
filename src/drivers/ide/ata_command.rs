/// ATA command opcodes used by the PIO driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum AtaCommand {
    AtaNop = 0x00,
    AtaReadSectors = 0x20,
    AtaWriteSectors = 0x30,
    AtaFlushCache = 0xE7,
    AtaIdentifyDevice = 0xEC,
}

impl AtaCommand {
    pub(super) fn discriminant(self) -> u8 {
        self as u8
    }
}
