//! # Storage abstraction layer
//!
//! This module provides the traits that connect the translation layers to
//! the physical flash devices below them and to the file-system layer
//! above them, together with the error type shared by the whole crate.
//!
//! # Design Philosophy
//!
//! The storage layer is designed around several core principles:
//!
//! - **Narrow seams**: each physical-layer trait is the minimal capability
//!   set the translation layer actually needs
//! - **Embedded-First**: designed for `no_std` environments with limited
//!   resources; no dynamic allocation during steady-state I/O
//! - **Safety**: strong typing prevents common storage access errors
//! - **Synchronous**: every operation runs to completion on the caller's
//!   stack; blocking is confined to the physical layer
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 File-system layer                   │
//! └─────────────────────────────────────────────────────┘
//!                          │  SectorDevice
//!                          ▼
//! ┌─────────────────────────────────────────────────────┐
//! │                      Journal                        │
//! └─────────────────────────────────────────────────────┘
//!                          │  SectorDevice
//!                          ▼
//! ┌──────────────────────────┬──────────────────────────┐
//! │    NAND translation      │     NOR translation      │
//! └──────────────────────────┴──────────────────────────┘
//!              │  NandFlash               │  NorFlash
//!              ▼                          ▼
//! ┌──────────────────────────┬──────────────────────────┐
//! │      SLC NAND device     │        NOR device        │
//! └──────────────────────────┴──────────────────────────┘
//! ```
//!
//! # Core Traits
//!
//! - [`NorFlash`]: byte-addressed NOR physical layer
//! - [`NandFlash`]: page-addressed NAND physical layer with spare areas
//! - [`SectorDevice`]: the uniform logical-sector interface presented by
//!   both translation layers and by the journal

/// Common error type for storage operations
pub mod error;

pub(crate) mod bitfield;

pub use self::error::Error;

/// Location of one NOR physical sector (erase unit) inside the device.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct NorSectorInfo {
    /// Byte offset of the first byte of the physical sector.
    pub off: u32,
    /// Size of the physical sector in bytes. Always a power of two.
    pub size: u32,
}

/// Physical-layer interface for NOR flash devices.
///
/// Implementations map these operations onto the actual device: memory
/// mapped parallel NOR, serial NOR behind SPI, or a simulation. All
/// operations are synchronous; ready polling and timeouts are the
/// implementation's responsibility and surface here as [`Error::Io`].
///
/// # Programming model
///
/// `program` may only clear bits (1 -> 0). Writing finer than
/// [`line_size`](NorFlash::line_size) is illegal, and whether a
/// once-programmed line may be programmed again (still only clearing
/// bits) is reported by [`can_rewrite`](NorFlash::can_rewrite). The
/// translation layer selects its on-flash header encoding from these two
/// properties.
pub trait NorFlash {
    /// Read `buf.len()` bytes starting at byte offset `off`.
    fn read(&mut self, off: u32, buf: &mut [u8]) -> Result<(), Error>;

    /// Program `data` starting at byte offset `off`. Only bit transitions
    /// from 1 to 0 take effect.
    fn program(&mut self, off: u32, data: &[u8]) -> Result<(), Error>;

    /// Erase one physical sector, setting every byte to `0xFF`.
    fn erase_sector(&mut self, sector: u32) -> Result<(), Error>;

    /// Byte offset and size of a physical sector.
    ///
    /// Physical sectors are numbered `0..num_sectors()` in address order.
    /// Devices with non-uniform layouts report a different size per
    /// sector.
    fn sector_info(&self, sector: u32) -> NorSectorInfo;

    /// Total number of physical sectors.
    fn num_sectors(&self) -> u32;

    /// Hardware write-protect indicator.
    fn is_write_protected(&self) -> bool;

    /// Minimum programming granularity in bytes (the "flash line").
    ///
    /// Must be a power of two. `1` for classic parallel NOR.
    fn line_size(&self) -> u32;

    /// Whether a programmed flash line can be programmed again while only
    /// clearing bits.
    fn can_rewrite(&self) -> bool;
}

/// Geometry of a NAND flash device.
///
/// Shift encodings keep all derived arithmetic to shifts and masks, the
/// way NAND geometry is naturally a power of two.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct NandDeviceInfo {
    /// Total number of erase blocks.
    pub num_blocks: u32,
    /// log2 of the number of pages per block (e.g. 6 for 64 pages).
    pub ppb_shift: u8,
    /// log2 of the number of data bytes per page (e.g. 11 for 2048).
    pub bpp_shift: u8,
}

impl NandDeviceInfo {
    /// Number of data bytes per page.
    pub fn bytes_per_page(&self) -> u32 {
        1 << self.bpp_shift
    }

    /// Number of spare-area bytes per page. By convention 1/32 of the
    /// data area (16 bytes for small-page, 64 for large-page devices).
    pub fn bytes_per_spare(&self) -> u32 {
        self.bytes_per_page() >> 5
    }
}

/// Physical-layer interface for SLC NAND flash devices.
///
/// Pages are addressed by a flat page index (`block * pages_per_block +
/// page_in_block`). Each page consists of a data area and a spare area;
/// one call can transfer spans of both so that data and its metadata land
/// in a single program operation on hardware that supports it.
pub trait NandFlash {
    /// Identify the device. Called once before any other access; must not
    /// read user data.
    fn device_info(&mut self) -> Result<NandDeviceInfo, Error>;

    /// Read from one page: `data.len()` bytes of the data area starting
    /// at `data_off`, and `spare.len()` bytes of the spare area starting
    /// at `spare_off`. Either slice may be empty.
    fn read_page(
        &mut self,
        page: u32,
        data: &mut [u8],
        data_off: u32,
        spare: &mut [u8],
        spare_off: u32,
    ) -> Result<(), Error>;

    /// Program one page: data-area and spare-area spans in a single
    /// operation. Either slice may be empty. Only bit transitions from
    /// 1 to 0 take effect.
    fn write_page(
        &mut self,
        page: u32,
        data: &[u8],
        data_off: u32,
        spare: &[u8],
        spare_off: u32,
    ) -> Result<(), Error>;

    /// Erase the block containing `first_page`, setting every byte of
    /// every page (data and spare) to `0xFF`.
    fn erase_block(&mut self, first_page: u32) -> Result<(), Error>;
}

/// Usage state of one logical sector, as reported by
/// [`SectorDevice::sector_usage`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SectorUsage {
    /// The sector holds committed data.
    InUse,
    /// The sector has never been written or has been trimmed.
    NotUsed,
    /// The driver cannot tell.
    Unknown,
}

/// The uniform logical-sector interface.
///
/// Both translation layers implement this trait, and the journal both
/// consumes and implements it, so the file-system layer above performs
/// all sector I/O through one interface regardless of the medium and of
/// whether journaling is active.
///
/// Logical sectors are fixed-size byte arrays identified by a 32-bit
/// zero-based index. A sector that has never been written (or has been
/// trimmed) reads as all-`0xFF`.
pub trait SectorDevice {
    /// Fill `n` sectors starting at `sector` into `buf`.
    ///
    /// `buf` must hold at least `n * sector_size()` bytes. Unwritten
    /// sectors return all-ones.
    fn read_sectors(&mut self, sector: u32, buf: &mut [u8], n: u32) -> Result<(), Error>;

    /// Write `n` sectors starting at `sector` from `data`.
    ///
    /// With `repeat_same == true`, `data` holds a single sector payload
    /// that is written to every target sector; otherwise it holds `n`
    /// consecutive payloads.
    fn write_sectors(&mut self, sector: u32, data: &[u8], n: u32, repeat_same: bool)
    -> Result<(), Error>;

    /// Mark `n` sectors starting at `sector` as containing no valid data.
    ///
    /// Trimmed sectors read as all-ones. Trimming is advisory for space
    /// management: the driver no longer needs to preserve the contents.
    fn trim_sectors(&mut self, sector: u32, n: u32) -> Result<(), Error>;

    /// Size of one logical sector in bytes.
    fn sector_size(&self) -> u32;

    /// Number of logical sectors presented.
    fn num_sectors(&self) -> u32;

    /// Report whether a logical sector currently holds data.
    fn sector_usage(&mut self, sector: u32) -> Result<SectorUsage, Error>;
}
