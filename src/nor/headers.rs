//! Physical- and logical-sector header codecs.
//!
//! Two fully parallel encodings exist, selected by the device's write
//! capabilities:
//!
//! - *Rewrite-capable* devices use a single progressive `type` byte in
//!   the physical-sector header and a `data_status` byte in the logical
//!   sector header; state changes rewrite the byte, clearing bits.
//! - *Write-once* devices cannot program a flash line twice, so the
//!   state transitions get one line each: `is_work` / `is_valid` in the
//!   physical header, `is_erasable` in the logical header.
//!
//! All sizes are derived at run time from the device's flash-line size,
//! so one driver build handles every line granularity.

/// Signature of physical sectors whose logical-sector headers carry no
/// valid `data_status` byte (written by earlier driver generations).
pub const SIGNATURE_LEGACY: u8 = 0x50;
/// Signature of physical sectors with the current header layout.
pub const SIGNATURE_CURRENT: u8 = 0x51;
/// Version byte of the current physical-sector format.
pub const FORMAT_VERSION: u8 = 1;

/// "ERSD": the erase-completion marker of the fail-safe erase protocol.
pub const ERASE_SIGNATURE_VALID: u32 = 0x4552_5344;
/// Marker value of a sector whose erase was interrupted.
pub const ERASE_SIGNATURE_INVALID: u32 = 0;

/// Stored logical-sector id of a blank slot.
pub const LOG_SECTOR_ID_BLANK: u32 = 0xFFFF_FFFF;
/// Stored logical-sector id of the info sector.
pub const LOG_SECTOR_ID_INFO: u32 = 0xFFFF_0000;
/// Bias added to logical-sector indices on flash so that neither all
/// zeros nor all ones is a valid stored id.
pub const LOG_SECTOR_ID_BIAS: u32 = 0x10_0000;

/// `data_status` of a blank (or legacy) logical-sector header.
pub const DATA_STAT_BLANK: u8 = 0xFF;
/// `data_status` of the current payload of a logical sector.
pub const DATA_STAT_VALID: u8 = 0xFE;
/// `data_status` of a stale slot awaiting erase.
pub const DATA_STAT_ERASABLE: u8 = 0x00;

const PSH_BASE_SIZE: u32 = 16;
const LSH_BASE_SIZE: u32 = 8;

/// Role of a physical sector.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PhySectorType {
    /// Target of relocations; holds no committed data.
    Work,
    /// Holds logical-sector slots.
    Data,
    /// Obsolete; scheduled for erase.
    Invalid,
}

/// Decoded physical-sector header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Psh {
    /// Layout signature; [`SIGNATURE_LEGACY`] or [`SIGNATURE_CURRENT`].
    pub signature: u8,
    /// Format version.
    pub format_version: u8,
    /// Fail-safe-erase capability flag, inverted: 0x00 means supported.
    pub fail_safe_erase: u8,
    /// Progressive role byte (rewrite-capable encoding).
    pub type_byte: u8,
    /// Number of times this sector was erased.
    pub erase_cnt: u32,
    /// Erase-completion marker.
    pub erase_signature: u32,
    /// Write-once encoding: 0x00 once the sector left the work role.
    pub is_work: u8,
    /// Write-once encoding: 0x00 once the sector became invalid.
    pub is_valid: u8,
}

impl Psh {
    /// A header as read from a freshly erased sector.
    pub fn blank() -> Psh {
        Psh {
            signature: 0xFF,
            format_version: 0xFF,
            fail_safe_erase: 0xFF,
            type_byte: 0xFF,
            erase_cnt: 0xFFFF_FFFF,
            erase_signature: 0xFFFF_FFFF,
            is_work: 0xFF,
            is_valid: 0xFF,
        }
    }

    /// Whether the signature marks a formatted sector.
    pub fn has_valid_signature(&self) -> bool {
        self.signature == SIGNATURE_LEGACY || self.signature == SIGNATURE_CURRENT
    }

    /// Decodes the sector role from whichever encoding is active.
    pub fn sector_type(&self, rewrite: bool) -> PhySectorType {
        if rewrite {
            match self.type_byte {
                0x00 => PhySectorType::Invalid,
                0x02 => PhySectorType::Data,
                _ => PhySectorType::Work,
            }
        } else if self.is_valid == 0 {
            PhySectorType::Invalid
        } else if self.is_work != 0 {
            PhySectorType::Work
        } else {
            PhySectorType::Data
        }
    }

    /// Encodes a role change. Every transition only clears bits in the
    /// affected field.
    pub fn set_sector_type(&mut self, rewrite: bool, t: PhySectorType) {
        if rewrite {
            self.type_byte = match t {
                PhySectorType::Work => 0xFF,
                PhySectorType::Data => 0x02,
                PhySectorType::Invalid => 0x00,
            };
        } else {
            match t {
                PhySectorType::Work => {}
                PhySectorType::Data => self.is_work = 0,
                PhySectorType::Invalid => self.is_valid = 0,
            }
        }
    }

    /// Whether the sector was formatted with fail-safe erase support.
    pub fn fail_safe_supported(&self) -> bool {
        self.has_valid_signature() && self.fail_safe_erase == 0
    }

    /// Whether the last erase ran to completion.
    pub fn erase_completed(&self) -> bool {
        self.erase_signature == ERASE_SIGNATURE_VALID
    }
}

/// Decoded logical-sector header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Lsh {
    /// Stored id: a biased logical-sector index or a special value.
    pub id: u32,
    /// Payload state byte.
    pub data_stat: u8,
    /// Write-once encoding: 0x00 once the slot became erasable.
    pub is_erasable: u8,
}

impl Lsh {
    /// A header as read from a blank slot.
    pub fn blank() -> Lsh {
        Lsh {
            id: LOG_SECTOR_ID_BLANK,
            data_stat: DATA_STAT_BLANK,
            is_erasable: 0xFF,
        }
    }
}

/// Classification of one logical-sector slot.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SlotState {
    /// Never written; usable for a fresh payload.
    Blank,
    /// Current payload of the contained logical-sector index.
    Valid(u32),
    /// The info sector.
    Info,
    /// Stale payload awaiting erase.
    Erasable,
}

/// Header sizes and field positions, derived from the flash-line size
/// and the rewrite capability of the device.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct HeaderLayout {
    /// Flash-line size in bytes (power of two).
    pub line_size: u32,
    /// Whether programmed lines may be programmed again.
    pub rewrite: bool,
}

fn align_up(v: u32, boundary: u32) -> u32 {
    (v + boundary - 1) & !(boundary - 1)
}

impl HeaderLayout {
    /// Size of the physical-sector header on flash.
    pub fn psh_size(&self) -> u32 {
        let base = align_up(PSH_BASE_SIZE, self.line_size);
        if self.rewrite {
            base
        } else {
            base + 2 * self.line_size // one line each for is_work / is_valid
        }
    }

    /// Size of the logical-sector header on flash.
    pub fn lsh_size(&self) -> u32 {
        let base = align_up(LSH_BASE_SIZE, self.line_size);
        if self.rewrite {
            base
        } else {
            base + self.line_size // one line for is_erasable
        }
    }

    /// Offset of the `is_work` line inside the physical-sector header.
    pub fn psh_off_is_work(&self) -> u32 {
        align_up(PSH_BASE_SIZE, self.line_size)
    }

    /// Offset of the `is_valid` line inside the physical-sector header.
    pub fn psh_off_is_valid(&self) -> u32 {
        self.psh_off_is_work() + self.line_size
    }

    /// Offset of the `is_erasable` line inside the logical-sector
    /// header.
    pub fn lsh_off_is_erasable(&self) -> u32 {
        align_up(LSH_BASE_SIZE, self.line_size)
    }

    /// Encodes a physical-sector header. `out` must hold
    /// [`psh_size`](Self::psh_size) bytes.
    pub fn encode_psh(&self, psh: &Psh, out: &mut [u8]) {
        out[..self.psh_size() as usize].fill(0xFF);
        out[0] = psh.signature;
        out[1] = psh.format_version;
        out[2] = psh.fail_safe_erase;
        out[3] = psh.type_byte;
        out[4..8].copy_from_slice(&psh.erase_cnt.to_le_bytes());
        out[8..12].copy_from_slice(&psh.erase_signature.to_le_bytes());
        if !self.rewrite {
            out[self.psh_off_is_work() as usize] = psh.is_work;
            out[self.psh_off_is_valid() as usize] = psh.is_valid;
        }
    }

    /// Decodes a physical-sector header.
    pub fn decode_psh(&self, raw: &[u8]) -> Psh {
        let mut psh = Psh {
            signature: raw[0],
            format_version: raw[1],
            fail_safe_erase: raw[2],
            type_byte: raw[3],
            erase_cnt: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            erase_signature: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            is_work: 0xFF,
            is_valid: 0xFF,
        };
        if !self.rewrite {
            psh.is_work = raw[self.psh_off_is_work() as usize];
            psh.is_valid = raw[self.psh_off_is_valid() as usize];
        }
        psh
    }

    /// Encodes a logical-sector header. `out` must hold
    /// [`lsh_size`](Self::lsh_size) bytes.
    pub fn encode_lsh(&self, lsh: &Lsh, out: &mut [u8]) {
        out[..self.lsh_size() as usize].fill(0xFF);
        out[..4].copy_from_slice(&lsh.id.to_le_bytes());
        out[4] = lsh.data_stat;
        if !self.rewrite {
            out[self.lsh_off_is_erasable() as usize] = lsh.is_erasable;
        }
    }

    /// Decodes a logical-sector header.
    pub fn decode_lsh(&self, raw: &[u8]) -> Lsh {
        let mut lsh = Lsh {
            id: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            data_stat: raw[4],
            is_erasable: 0xFF,
        };
        if !self.rewrite {
            lsh.is_erasable = raw[self.lsh_off_is_erasable() as usize];
        }
        lsh
    }

    /// Classifies a slot from its header.
    ///
    /// `legacy` selects the decoding of physical sectors written before
    /// the `data_status` byte existed. The second return value reports
    /// whether the header is self-consistent; an inconsistent header is
    /// the trace of an interrupted invalidation or of a mixed-version
    /// write history, and the mount code decides how to repair it.
    pub fn classify_slot(
        &self,
        lsh: &Lsh,
        legacy: bool,
        num_log_sectors: u32,
    ) -> (SlotState, bool) {
        let mut consistent = true;
        let state;
        if legacy {
            state = match lsh.id {
                LOG_SECTOR_ID_BLANK => SlotState::Blank,
                LOG_SECTOR_ID_INFO => SlotState::Info,
                0 => SlotState::Erasable,
                id => {
                    if !self.rewrite && lsh.is_erasable == 0 {
                        SlotState::Erasable
                    } else {
                        let lsi = id.wrapping_sub(LOG_SECTOR_ID_BIAS);
                        if lsi < num_log_sectors {
                            SlotState::Valid(lsi)
                        } else {
                            SlotState::Erasable
                        }
                    }
                }
            };
        } else {
            let mut data_stat = lsh.data_stat;
            if !self.rewrite && lsh.is_erasable == 0 {
                data_stat = DATA_STAT_ERASABLE;
            }
            if lsh.id == LOG_SECTOR_ID_BLANK && data_stat == DATA_STAT_BLANK {
                state = SlotState::Blank;
            } else if data_stat == DATA_STAT_VALID {
                if lsh.id == LOG_SECTOR_ID_INFO {
                    state = SlotState::Info;
                } else if lsh.id == 0 {
                    // Invalidated by a driver generation that cleared
                    // only the id.
                    state = SlotState::Erasable;
                } else {
                    let lsi = lsh.id.wrapping_sub(LOG_SECTOR_ID_BIAS);
                    if lsi < num_log_sectors {
                        state = SlotState::Valid(lsi);
                    } else {
                        state = SlotState::Erasable;
                    }
                }
            } else {
                // A valid-looking id under a blank status byte is the
                // trace of an interrupted write or of an older driver
                // writing into a current-format sector.
                if data_stat == DATA_STAT_BLANK
                    && lsh.id != LOG_SECTOR_ID_INFO
                    && lsh.id != LOG_SECTOR_ID_BLANK
                {
                    let lsi = lsh.id.wrapping_sub(LOG_SECTOR_ID_BIAS);
                    if lsi < num_log_sectors {
                        return (SlotState::Valid(lsi), false);
                    }
                }
                state = SlotState::Erasable;
            }
        }
        if (lsh.id != 0 && lsh.data_stat == 0) || (lsh.id == 0 && lsh.data_stat != 0) {
            consistent = false;
        }
        (state, consistent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REWRITE: HeaderLayout = HeaderLayout { line_size: 1, rewrite: true };
    const WRITE_ONCE: HeaderLayout = HeaderLayout { line_size: 4, rewrite: false };

    #[test]
    fn test_header_sizes() {
        assert_eq!(REWRITE.psh_size(), 16);
        assert_eq!(REWRITE.lsh_size(), 8);
        assert_eq!(WRITE_ONCE.psh_size(), 24);
        assert_eq!(WRITE_ONCE.lsh_size(), 12);
        let wide = HeaderLayout { line_size: 32, rewrite: false };
        assert_eq!(wide.psh_size(), 96);
        assert_eq!(wide.lsh_size(), 64);
    }

    #[test]
    fn test_psh_round_trip() {
        for layout in [REWRITE, WRITE_ONCE] {
            let mut psh = Psh::blank();
            psh.signature = SIGNATURE_CURRENT;
            psh.format_version = FORMAT_VERSION;
            psh.erase_cnt = 1234;
            psh.erase_signature = ERASE_SIGNATURE_VALID;
            psh.set_sector_type(layout.rewrite, PhySectorType::Data);
            let mut raw = [0u8; 96];
            layout.encode_psh(&psh, &mut raw);
            let decoded = layout.decode_psh(&raw);
            assert_eq!(decoded.erase_cnt, 1234);
            assert!(decoded.erase_completed());
            assert_eq!(decoded.sector_type(layout.rewrite), PhySectorType::Data);
        }
    }

    #[test]
    fn test_blank_sector_is_work() {
        // A freshly erased sector must decode as WORK in both
        // encodings, so that formatting can claim it without a header
        // rewrite.
        let psh = Psh::blank();
        assert_eq!(psh.sector_type(true), PhySectorType::Work);
        assert_eq!(psh.sector_type(false), PhySectorType::Work);
    }

    #[test]
    fn test_type_transitions_clear_bits_only() {
        let mut psh = Psh::blank();
        psh.set_sector_type(true, PhySectorType::Data);
        assert_eq!(psh.type_byte & !0xFF, 0);
        let data_byte = psh.type_byte;
        psh.set_sector_type(true, PhySectorType::Invalid);
        assert_eq!(data_byte & psh.type_byte, psh.type_byte);
    }

    #[test]
    fn test_lsh_classify_states() {
        let layout = REWRITE;
        let blank = Lsh::blank();
        assert_eq!(layout.classify_slot(&blank, false, 100), (SlotState::Blank, true));

        let valid = Lsh { id: LOG_SECTOR_ID_BIAS + 7, data_stat: DATA_STAT_VALID, is_erasable: 0xFF };
        assert_eq!(layout.classify_slot(&valid, false, 100), (SlotState::Valid(7), true));

        let info = Lsh { id: LOG_SECTOR_ID_INFO, data_stat: DATA_STAT_VALID, is_erasable: 0xFF };
        assert_eq!(layout.classify_slot(&info, false, 100), (SlotState::Info, true));

        let erasable = Lsh { id: 0, data_stat: DATA_STAT_ERASABLE, is_erasable: 0xFF };
        assert_eq!(layout.classify_slot(&erasable, false, 100), (SlotState::Erasable, true));

        let out_of_range = Lsh { id: LOG_SECTOR_ID_BIAS + 100, data_stat: DATA_STAT_VALID, is_erasable: 0xFF };
        assert_eq!(layout.classify_slot(&out_of_range, false, 100), (SlotState::Erasable, true));
    }

    #[test]
    fn test_lsh_inconsistent_headers_flagged() {
        let layout = REWRITE;
        // Id written, status still blank: interrupted write.
        let torn = Lsh { id: LOG_SECTOR_ID_BIAS + 3, data_stat: DATA_STAT_BLANK, is_erasable: 0xFF };
        let (state, consistent) = layout.classify_slot(&torn, false, 100);
        assert_eq!(state, SlotState::Valid(3));
        assert!(!consistent);
        // Status cleared, id left standing: interrupted invalidation.
        let half = Lsh { id: LOG_SECTOR_ID_BIAS + 3, data_stat: 0, is_erasable: 0xFF };
        let (state, consistent) = layout.classify_slot(&half, false, 100);
        assert_eq!(state, SlotState::Erasable);
        assert!(!consistent);
    }

    #[test]
    fn test_lsh_legacy_decoding() {
        let layout = REWRITE;
        let valid = Lsh { id: LOG_SECTOR_ID_BIAS + 9, data_stat: 0xFF, is_erasable: 0xFF };
        assert_eq!(layout.classify_slot(&valid, true, 100), (SlotState::Valid(9), true));
        let erased = Lsh { id: 0, data_stat: 0xFF, is_erasable: 0xFF };
        let (state, _) = layout.classify_slot(&erased, true, 100);
        assert_eq!(state, SlotState::Erasable);
    }

    #[test]
    fn test_write_once_erasable_line() {
        let layout = WRITE_ONCE;
        let lsh = Lsh { id: LOG_SECTOR_ID_BIAS + 4, data_stat: DATA_STAT_VALID, is_erasable: 0 };
        let (state, _) = layout.classify_slot(&lsh, false, 100);
        assert_eq!(state, SlotState::Erasable);
    }
}
