mod common;

use common::{pattern, DiskOp, SimDisk};
use libflash::journal::{Journal, OverflowAction, MAX_OPEN_CNT};
use libflash::storage::{Error, SectorDevice};

const BPS: u32 = 512;
const NUM_SECTORS: u32 = 64;
const JOURNAL_FIRST: u32 = 48;
const JOURNAL_SECTORS: u32 = 16;
const INFO_SECTOR: u32 = JOURNAL_FIRST + JOURNAL_SECTORS - 1;
// 16 reserved sectors leave room for 13 entries (one copy-list sector).
const NUM_ENTRIES: u32 = 13;

fn new_journal() -> Journal<SimDisk> {
    let mut journal = Journal::new(SimDisk::new(NUM_SECTORS, BPS));
    journal.create(JOURNAL_FIRST, JOURNAL_SECTORS, true).unwrap();
    journal.device_mut().ops.clear();
    journal
}

#[test]
fn test_create_and_mount() {
    let mut journal = new_journal();
    assert!(journal.is_present());
    assert_eq!(journal.num_free_entries(), NUM_ENTRIES);
    let disk = journal.into_inner();
    let mut journal = Journal::new(disk);
    assert!(!journal.is_present());
    journal.mount(INFO_SECTOR).unwrap();
    assert!(journal.is_present());
    assert!(journal.info().free_sector_supported);
}

#[test]
fn test_mount_blank_device_fails() {
    let mut journal = Journal::new(SimDisk::new(NUM_SECTORS, BPS));
    assert_eq!(journal.mount(INFO_SECTOR), Err(Error::NotFormatted));
    // Without a journal everything passes through.
    let payload = pattern(1, BPS as usize);
    journal.write_sectors(2, &payload, 1, false).unwrap();
    assert_eq!(journal.device_mut().sector(2), &payload[..]);
}

#[test]
fn test_committed_write_lands_on_device() {
    let mut journal = new_journal();
    let a = pattern(0xA, BPS as usize);
    let b = pattern(0xB, BPS as usize);
    journal.begin().unwrap();
    journal.write_sectors(3, &a, 1, false).unwrap();
    journal.write_sectors(3, &b, 1, false).unwrap();
    // Rewriting the same sector reuses its slot.
    assert_eq!(journal.num_free_entries(), NUM_ENTRIES - 1);
    // Not visible on the device before commit, but visible through the
    // journal.
    assert!(journal.device_mut().sector(3).iter().all(|&x| x == 0xFF));
    let mut buf = vec![0u8; BPS as usize];
    journal.read_sectors(3, &mut buf, 1).unwrap();
    assert_eq!(buf, b);
    journal.end().unwrap();
    assert_eq!(journal.device_mut().sector(3), &b[..]);
    assert_eq!(journal.num_free_entries(), NUM_ENTRIES);
    // A remount finds a clean journal and the committed data.
    let mut journal = Journal::new(journal.into_inner());
    journal.mount(INFO_SECTOR).unwrap();
    let mut buf = vec![0u8; BPS as usize];
    journal.read_sectors(3, &mut buf, 1).unwrap();
    assert_eq!(buf, b);
}

#[test]
fn test_power_cut_at_every_point_is_atomic() {
    let mut journal = new_journal();
    let baseline = journal.device_mut().snapshot();
    let b = pattern(0xB, BPS as usize);
    let c = pattern(0xC, BPS as usize);
    journal.begin().unwrap();
    journal.write_sectors(3, &b, 1, false).unwrap();
    journal.write_sectors(5, &c, 1, false).unwrap();
    journal.end().unwrap();
    let ops = journal.into_inner().ops;
    // Interrupt after every single device write: the volume must mount
    // to either the state before the transaction or the state after it,
    // never a mix.
    for cut in 0..=ops.len() {
        let mut disk = baseline.clone();
        disk.replay(&ops, cut);
        let mut journal = Journal::new(disk);
        journal.mount(INFO_SECTOR).unwrap();
        let mut s3 = vec![0u8; BPS as usize];
        let mut s5 = vec![0u8; BPS as usize];
        journal.read_sectors(3, &mut s3, 1).unwrap();
        journal.read_sectors(5, &mut s5, 1).unwrap();
        let before = s3.iter().all(|&x| x == 0xFF) && s5.iter().all(|&x| x == 0xFF);
        let after = s3 == b && s5 == c;
        assert!(before || after, "torn state at cut point {cut}");
    }
}

#[test]
fn test_power_cut_before_and_after_commit_point() {
    let mut journal = new_journal();
    let baseline = journal.device_mut().snapshot();
    let b = pattern(0xB, BPS as usize);
    let c = pattern(0xC, BPS as usize);
    journal.begin().unwrap();
    journal.write_sectors(3, &b, 1, false).unwrap();
    journal.write_sectors(5, &c, 1, false).unwrap();
    journal.end().unwrap();
    let ops = journal.into_inner().ops;
    // The commit point is the status-sector write carrying the entry
    // count.
    let commit = ops
        .iter()
        .position(|op| match op {
            DiskOp::Write { sector, data } => {
                *sector == JOURNAL_FIRST
                    && &data[..14] == b"Journal status"
                    && u32::from_le_bytes([data[0x10], data[0x11], data[0x12], data[0x13]]) != 0
            }
            _ => false,
        })
        .expect("no commit write recorded");
    // Cut just before the status write: the transaction never happened.
    let mut disk = baseline.clone();
    disk.replay(&ops, commit);
    let mut journal = Journal::new(disk);
    journal.mount(INFO_SECTOR).unwrap();
    let mut s3 = vec![0u8; BPS as usize];
    journal.read_sectors(3, &mut s3, 1).unwrap();
    assert!(s3.iter().all(|&x| x == 0xFF));
    // Cut right after it: mount replays to completion and clears the
    // status sector.
    let mut disk = baseline.clone();
    disk.replay(&ops, commit + 1);
    let mut journal = Journal::new(disk);
    journal.mount(INFO_SECTOR).unwrap();
    let mut s3 = vec![0u8; BPS as usize];
    let mut s5 = vec![0u8; BPS as usize];
    journal.read_sectors(3, &mut s3, 1).unwrap();
    journal.read_sectors(5, &mut s5, 1).unwrap();
    assert_eq!(s3, b);
    assert_eq!(s5, c);
    let disk = journal.into_inner();
    let status = disk.sector(JOURNAL_FIRST);
    assert_eq!(&status[..14], b"Journal status");
    assert_eq!(&status[0x10..0x14], &[0, 0, 0, 0]);
    // Mounting again is a no-op; the data stays.
    let mut journal = Journal::new(disk);
    journal.mount(INFO_SECTOR).unwrap();
    journal.read_sectors(3, &mut s3, 1).unwrap();
    assert_eq!(s3, b);
}

#[test]
fn test_nested_transactions_commit_at_outermost_end() {
    let mut journal = new_journal();
    let a = pattern(0xA, BPS as usize);
    journal.begin().unwrap();
    journal.begin().unwrap();
    assert_eq!(journal.open_count(), 2);
    journal.write_sectors(9, &a, 1, false).unwrap();
    journal.end().unwrap();
    assert_eq!(journal.open_count(), 1);
    assert!(journal.device_mut().sector(9).iter().all(|&x| x == 0xFF));
    journal.end().unwrap();
    assert_eq!(journal.open_count(), 0);
    assert_eq!(journal.device_mut().sector(9), &a[..]);
}

#[test]
fn test_open_count_clamps() {
    let mut journal = new_journal();
    for _ in 0..MAX_OPEN_CNT {
        journal.begin().unwrap();
    }
    assert_eq!(journal.begin(), Err(Error::TooManyTransactions));
    assert_eq!(journal.open_count(), MAX_OPEN_CNT);
}

#[test]
fn test_end_without_begin_fails() {
    let mut journal = new_journal();
    assert_eq!(journal.end(), Err(Error::NoOpenTransaction));
}

#[test]
fn test_write_error_latches_and_cancels() {
    let mut journal = new_journal();
    let a = pattern(0xA, BPS as usize);
    journal.begin().unwrap();
    journal.device_mut().fail_writes_after = Some(0);
    assert_eq!(journal.write_sectors(3, &a, 1, false), Err(Error::Io));
    // Every further mutation reports the latched error without touching
    // the device.
    assert_eq!(journal.write_sectors(4, &a, 1, false), Err(Error::Io));
    assert_eq!(journal.trim_sectors(5, 1), Err(Error::Io));
    journal.device_mut().fail_writes_after = None;
    assert_eq!(journal.end(), Err(Error::Io));
    assert!(journal.device_mut().sector(3).iter().all(|&x| x == 0xFF));
    // The next transaction starts clean.
    journal.begin().unwrap();
    journal.write_sectors(3, &a, 1, false).unwrap();
    journal.end().unwrap();
    assert_eq!(journal.device_mut().sector(3), &a[..]);
}

#[test]
fn test_read_error_latches_mid_transaction() {
    let mut journal = new_journal();
    let a = pattern(0xA, BPS as usize);
    journal.write_sectors(6, &a, 1, false).unwrap();
    journal.begin().unwrap();
    journal.write_sectors(3, &a, 1, false).unwrap();
    // An uncached sector forces a device read, which fails and latches.
    journal.device_mut().fail_reads = true;
    let mut buf = vec![0u8; BPS as usize];
    assert_eq!(journal.read_sectors(6, &mut buf, 1), Err(Error::Io));
    journal.device_mut().fail_reads = false;
    assert_eq!(journal.read_sectors(6, &mut buf, 1), Err(Error::Io));
    assert_eq!(journal.write_sectors(4, &a, 1, false), Err(Error::Io));
    assert_eq!(journal.end(), Err(Error::Io));
    // The transaction was dropped; the pre-transaction state stands.
    assert!(journal.device_mut().sector(3).iter().all(|&x| x == 0xFF));
    assert_eq!(journal.device_mut().sector(6), &a[..]);
}

#[test]
fn test_overflow_flushes_by_default() {
    let mut journal = new_journal();
    journal.begin().unwrap();
    for i in 0..NUM_ENTRIES + 1 {
        let payload = pattern(i, BPS as usize);
        journal.write_sectors(i, &payload, 1, false).unwrap();
    }
    journal.end().unwrap();
    assert_eq!(journal.counters().overflow_cnt, 1);
    for i in 0..NUM_ENTRIES + 1 {
        assert_eq!(journal.device_mut().sector(i), &pattern(i, BPS as usize)[..]);
    }
}

#[test]
fn test_overflow_abort_drops_transaction() {
    let mut journal = new_journal();
    journal.set_overflow_handler(|_| OverflowAction::Abort);
    journal.begin().unwrap();
    for i in 0..NUM_ENTRIES {
        let payload = pattern(i, BPS as usize);
        journal.write_sectors(i, &payload, 1, false).unwrap();
    }
    let payload = pattern(99, BPS as usize);
    assert_eq!(
        journal.write_sectors(NUM_ENTRIES, &payload, 1, false),
        Err(Error::OutOfSpace)
    );
    assert_eq!(journal.end(), Err(Error::OutOfSpace));
    for i in 0..NUM_ENTRIES + 1 {
        assert!(journal.device_mut().sector(i).iter().all(|&x| x == 0xFF));
    }
}

#[test]
fn test_trim_recorded_and_replayed() {
    let mut journal = new_journal();
    let a = pattern(0xA, BPS as usize);
    let b = pattern(0xB, BPS as usize);
    // Outside a transaction the write passes through.
    journal.write_sectors(7, &a, 1, false).unwrap();
    journal.begin().unwrap();
    journal.trim_sectors(7, 1).unwrap();
    // Within the transaction the trim is already visible.
    let mut buf = vec![0u8; BPS as usize];
    journal.read_sectors(7, &mut buf, 1).unwrap();
    assert!(buf.iter().all(|&x| x == 0xFF));
    assert_eq!(journal.device_mut().sector(7), &a[..]);
    journal.write_sectors(8, &b, 1, false).unwrap();
    journal.end().unwrap();
    assert!(journal.device_mut().sector(7).iter().all(|&x| x == 0xFF));
    assert_eq!(journal.device_mut().sector(8), &b[..]);
}

#[test]
fn test_trim_without_support_is_a_successful_no_op() {
    let mut journal = Journal::new(SimDisk::new(NUM_SECTORS, BPS));
    journal.create(JOURNAL_FIRST, JOURNAL_SECTORS, false).unwrap();
    let a = pattern(0xA, BPS as usize);
    journal.write_sectors(7, &a, 1, false).unwrap();
    journal.begin().unwrap();
    journal.trim_sectors(7, 1).unwrap();
    journal.end().unwrap();
    assert_eq!(journal.device_mut().sector(7), &a[..]);
}

#[test]
fn test_invalidate_discards_uncommitted_entries() {
    let mut journal = new_journal();
    let a = pattern(0xA, BPS as usize);
    journal.begin().unwrap();
    journal.write_sectors(3, &a, 1, false).unwrap();
    journal.invalidate();
    journal.end().unwrap();
    assert!(journal.device_mut().sector(3).iter().all(|&x| x == 0xFF));
}

#[test]
fn test_reads_batch_across_cached_and_uncached_sectors() {
    let mut journal = new_journal();
    let direct = pattern(1, BPS as usize);
    let staged = pattern(2, BPS as usize);
    journal.write_sectors(10, &direct, 1, false).unwrap();
    journal.write_sectors(12, &direct, 1, false).unwrap();
    journal.begin().unwrap();
    journal.write_sectors(11, &staged, 1, false).unwrap();
    let mut buf = vec![0u8; 3 * BPS as usize];
    journal.read_sectors(10, &mut buf, 3).unwrap();
    assert_eq!(&buf[..BPS as usize], &direct[..]);
    assert_eq!(&buf[BPS as usize..2 * BPS as usize], &staged[..]);
    assert_eq!(&buf[2 * BPS as usize..], &direct[..]);
    journal.end().unwrap();
}

#[test]
fn test_repeat_same_writes_one_payload_everywhere() {
    let mut journal = new_journal();
    let fill = pattern(0xF, BPS as usize);
    journal.begin().unwrap();
    journal.write_sectors(20, &fill, 3, true).unwrap();
    journal.end().unwrap();
    for sector in 20..23 {
        assert_eq!(journal.device_mut().sector(sector), &fill[..]);
    }
}
