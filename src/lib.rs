//! # libflash - Fail-safe block storage for raw flash
//!
//! A Rust library that turns raw NAND or NOR flash into a flat array of
//! logical sectors with atomic-update guarantees, wear leveling and
//! bad-block management. The library is designed for embedded systems and
//! supports `no_std` environments.
//!
//! ## Features
//!
//! ### Translation layers
//! - **NAND**: log-structured translation layer for SLC NAND with ECC,
//!   work blocks for partial-block updates, passive and active wear
//!   leveling and bad-block management
//! - **NOR**: sector-map translation layer for NOR flash with per-sector
//!   headers, garbage collection, wear leveling and a fail-safe erase
//!   protocol
//!
//! ### Journaling
//! - Sector-level write-ahead log that makes sequences of sector writes
//!   and trims atomic across unexpected power loss
//! - Nested transactions with commit at the outermost close
//!
//! ### Storage abstraction
//! - Narrow physical-layer traits for NOR and NAND devices
//! - A uniform logical-sector interface shared by both translation layers
//!   and the journal
//!
//! ## Usage
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! libflash = "0.1.0"
//! ```
//!
//! ### Mounting a NOR translation layer
//!
//! ```rust,no_run
//! use libflash::nor::NorTl;
//! use libflash::storage::SectorDevice;
//! # use libflash::storage::{Error, NorFlash, NorSectorInfo};
//! # struct MyNor;
//! # impl NorFlash for MyNor {
//! #     fn read(&mut self, _off: u32, _buf: &mut [u8]) -> Result<(), Error> { Ok(()) }
//! #     fn program(&mut self, _off: u32, _data: &[u8]) -> Result<(), Error> { Ok(()) }
//! #     fn erase_sector(&mut self, _sector: u32) -> Result<(), Error> { Ok(()) }
//! #     fn sector_info(&self, _sector: u32) -> NorSectorInfo { NorSectorInfo { off: 0, size: 4096 } }
//! #     fn num_sectors(&self) -> u32 { 16 }
//! #     fn is_write_protected(&self) -> bool { false }
//! #     fn line_size(&self) -> u32 { 1 }
//! #     fn can_rewrite(&self) -> bool { true }
//! # }
//!
//! let mut tl = NorTl::new(MyNor, 512);
//! if tl.requires_format()? {
//!     tl.format_low_level()?;
//! }
//! tl.mount()?;
//! let payload = [0u8; 512];
//! tl.write_sectors(0, &payload, 1, false)?;
//! # Ok::<(), libflash::storage::Error>(())
//! ```
//!
//! ### Wrapping a volume in a journal
//!
//! ```rust,ignore
//! let mut journal = Journal::new(tl);
//! journal.mount()?;          // replays a previously committed transaction
//! journal.begin()?;
//! journal.write_sectors(3, &payload, 1, false)?;
//! journal.end()?;            // commit point: all or nothing
//! ```
//!
//! ## Platform support
//!
//! This library is designed to work on:
//! - Embedded microcontrollers (ARM Cortex-M, RISC-V, etc.)
//! - Any platform supporting Rust's `core` library
//!
//! The core is single-threaded and strictly synchronous: every operation
//! runs to completion on the caller's stack, and only the physical-layer
//! calls may block. Thread safety, when required, is provided by an
//! external locking layer around the volume entry points.
//!
//! ## Optional Features
//!
//! - `std`: Enable standard library support (default: disabled)
//! - `defmt`: Enable defmt logging support for embedded debugging

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

/// Storage abstraction layer: physical-device traits, the logical-sector
/// interface and the shared error type.
pub mod storage;

/// Sector-level write-ahead log providing atomic multi-sector updates.
pub mod journal;

/// Log-structured translation layer for SLC NAND flash.
pub mod nand;

/// Sector-map translation layer for NOR flash.
pub mod nor;
