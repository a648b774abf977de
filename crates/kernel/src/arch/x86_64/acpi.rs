//! # ACPI table discovery (RSDP → RSDT/XSDT → MADT)
//!
//! The only consumer in this kernel is the IO-APIC: the MADT ("APIC"
//! signature) carries the physical address of each IO-APIC. Discovery:
//!
//! 1. Scan the BIOS read-only window `[0xE0000, 0x100000)` on 16-byte
//!    boundaries for the 8-byte signature `"RSD PTR "`.
//! 2. RSDP revision ≥ 2 points at the XSDT (64-bit pointer at offset 24),
//!    older tables at the RSDT (32-bit pointer at offset 16).
//! 3. Walk the root table's children (capped at 32 entries) for a header
//!    whose signature is `"APIC"`.
//! 4. Walk the MADT's variable-length records; type 1 is an IO-APIC
//!    record `{id, physical address, GSI base}`.
//!
//! All walking is done through raw physical pointers under the identity
//! mapping, with unaligned reads, since firmware only guarantees 4-byte
//! alignment for the root tables and none for record interiors.

use core::ptr::read_unaligned;

/// BIOS window scanned for the RSDP
pub const BIOS_SCAN_START: u64 = 0xE0000;
pub const BIOS_SCAN_END: u64 = 0x10_0000;

/// Cap on root-table children walked, a lid on malformed firmware.
const MAX_SDT_ENTRIES: usize = 32;

/// MADT record type for an IO-APIC
const MADT_ENTRY_IOAPIC: u8 = 1;

/// Root System Description Pointer (ACPI 1.0 part)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct Rsdp {
    signature: [u8; 8], // "RSD PTR "
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_address: u32,
}

/// ACPI 2.0+ extension (follows the 1.0 part in memory)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct RsdpExtended {
    rsdp: Rsdp,
    length: u32,
    xsdt_address: u64,
    extended_checksum: u8,
    reserved: [u8; 3],
}

/// Common System Description Table header
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

/// MADT fixed part
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct MadtHeader {
    header: SdtHeader,
    local_apic_address: u32,
    flags: u32,
}

/// Variable-length MADT record header
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct MadtEntryHeader {
    entry_type: u8,
    length: u8,
}

/// MADT type-1 record body
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct MadtIoApicEntry {
    header: MadtEntryHeader,
    id: u8,
    reserved: u8,
    address: u32,
    gsi_base: u32,
}

/// An IO-APIC as described by the MADT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoApicRecord {
    pub id: u8,
    pub address: u32,
    pub gsi_base: u32,
}

/// Scan a window on 16-byte boundaries for the RSDP signature.
///
/// # Safety
///
/// The whole window must be readable (identity-mapped).
pub unsafe fn find_rsdp(scan_start: u64, scan_end: u64) -> Option<u64> {
    let mut addr = scan_start;
    while addr + core::mem::size_of::<Rsdp>() as u64 <= scan_end {
        let candidate = read_unaligned(addr as *const [u8; 8]);
        if &candidate == b"RSD PTR " {
            return Some(addr);
        }
        addr += 16;
    }
    None
}

/// Resolve the RSDP to its root table: `(table physical, is_xsdt)`.
///
/// # Safety
///
/// `rsdp_addr` must point at a readable RSDP.
unsafe fn root_table(rsdp_addr: u64) -> Option<(u64, bool)> {
    let rsdp = read_unaligned(rsdp_addr as *const Rsdp);
    if rsdp.revision >= 2 {
        let extended = read_unaligned(rsdp_addr as *const RsdpExtended);
        let xsdt = extended.xsdt_address;
        if xsdt != 0 {
            return Some((xsdt, true));
        }
    }
    if rsdp.rsdt_address != 0 {
        return Some((rsdp.rsdt_address as u64, false));
    }
    None
}

/// Walk the root table's children for one with the given signature.
///
/// # Safety
///
/// `table_addr` must point at a readable RSDT/XSDT and every child
/// pointer it holds must be readable.
unsafe fn find_child_table(table_addr: u64, is_xsdt: bool, signature: &[u8; 4]) -> Option<u64> {
    let header = read_unaligned(table_addr as *const SdtHeader);
    let header_size = core::mem::size_of::<SdtHeader>();
    if (header.length as usize) < header_size {
        return None;
    }

    let pointer_size = if is_xsdt { 8 } else { 4 };
    let count = (header.length as usize - header_size) / pointer_size;
    let entries = table_addr + header_size as u64;

    for i in 0..count.min(MAX_SDT_ENTRIES) {
        let entry_addr = entries + (i * pointer_size) as u64;
        let child = if is_xsdt {
            read_unaligned(entry_addr as *const u64)
        } else {
            read_unaligned(entry_addr as *const u32) as u64
        };
        if child == 0 {
            continue;
        }
        let child_sig = read_unaligned(child as *const [u8; 4]);
        if &child_sig == signature {
            return Some(child);
        }
    }
    None
}

/// Walk the MADT's records for the first IO-APIC entry.
///
/// # Safety
///
/// `madt_addr` must point at a readable MADT.
unsafe fn find_ioapic_in_madt(madt_addr: u64) -> Option<IoApicRecord> {
    let madt = read_unaligned(madt_addr as *const MadtHeader);
    let total = madt.header.length as u64;
    let mut offset = core::mem::size_of::<MadtHeader>() as u64;

    while offset + 2 <= total {
        let entry = read_unaligned((madt_addr + offset) as *const MadtEntryHeader);
        if entry.length < 2 {
            break; // malformed record, refuse to loop forever
        }
        if entry.entry_type == MADT_ENTRY_IOAPIC
            && offset + core::mem::size_of::<MadtIoApicEntry>() as u64 <= total
        {
            let record = read_unaligned((madt_addr + offset) as *const MadtIoApicEntry);
            return Some(IoApicRecord {
                id: record.id,
                address: record.address,
                gsi_base: record.gsi_base,
            });
        }
        offset += entry.length as u64;
    }
    None
}

/// Full discovery chain over a scan window: RSDP → root table → MADT →
/// first IO-APIC record.
///
/// # Safety
///
/// The window and every table the chain points at must be readable
/// through the identity mapping.
pub unsafe fn find_ioapic_from_madt(scan_start: u64, scan_end: u64) -> Option<IoApicRecord> {
    let rsdp = find_rsdp(scan_start, scan_end)?;
    let (root, is_xsdt) = root_table(rsdp)?;
    let madt = find_child_table(root, is_xsdt, b"APIC")?;
    find_ioapic_in_madt(madt)
}

/// Boot-time discovery over the BIOS window, with logging.
///
/// # Safety
///
/// Low memory must be identity-mapped.
pub unsafe fn discover_ioapic(scan_start: u64, scan_end: u64) -> Option<IoApicRecord> {
    match find_ioapic_from_madt(scan_start, scan_end) {
        Some(record) => {
            crate::kinfo!(
                "[ACPI] MADT IO-APIC id={} at {:#x}, gsi base {}",
                record.id,
                record.address,
                record.gsi_base
            );
            Some(record)
        }
        None => {
            crate::kwarn!("[ACPI] no MADT IO-APIC record found");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u32(buf: &mut Vec<u8>, value: u32) {
        buf.extend_from_slice(&value.to_le_bytes());
    }

    fn push_u64(buf: &mut Vec<u8>, value: u64) {
        buf.extend_from_slice(&value.to_le_bytes());
    }

    /// SDT header with the length field patched in afterwards.
    fn push_sdt_header(buf: &mut Vec<u8>, signature: &[u8; 4], total_len: u32) {
        buf.extend_from_slice(signature);
        push_u32(buf, total_len);
        buf.push(1); // revision
        buf.push(0); // checksum (not validated here)
        buf.extend_from_slice(b"RODNIX");
        buf.extend_from_slice(b"RODNIXTB");
        push_u32(buf, 1);
        push_u32(buf, 0x2020_2020);
        push_u32(buf, 1);
    }

    fn build_madt(ioapic_addr: u32, gsi_base: u32) -> Vec<u8> {
        let mut madt = Vec::new();
        let total = 36 + 8 + 12;
        push_sdt_header(&mut madt, b"APIC", total as u32);
        push_u32(&mut madt, 0xFEE0_0000); // local APIC address
        push_u32(&mut madt, 1); // flags: PC-AT compatible
        // One type-1 (IO-APIC) record.
        madt.push(MADT_ENTRY_IOAPIC);
        madt.push(12);
        madt.push(2); // io-apic id
        madt.push(0); // reserved
        push_u32(&mut madt, ioapic_addr);
        push_u32(&mut madt, gsi_base);
        assert_eq!(madt.len(), total);
        madt
    }

    fn build_madt_with_leading_lapics(ioapic_addr: u32) -> Vec<u8> {
        let mut madt = Vec::new();
        let total = 36 + 8 + 8 + 8 + 12;
        push_sdt_header(&mut madt, b"APIC", total as u32);
        push_u32(&mut madt, 0xFEE0_0000);
        push_u32(&mut madt, 1);
        // Two type-0 (local APIC) records ahead of the IO-APIC one.
        for cpu in 0..2u8 {
            madt.push(0);
            madt.push(8);
            madt.push(cpu);
            madt.push(cpu);
            push_u32(&mut madt, 1); // enabled
        }
        madt.push(MADT_ENTRY_IOAPIC);
        madt.push(12);
        madt.push(0);
        madt.push(0);
        push_u32(&mut madt, ioapic_addr);
        push_u32(&mut madt, 0);
        assert_eq!(madt.len(), total);
        madt
    }

    fn build_xsdt(children: &[u64]) -> Vec<u8> {
        let mut xsdt = Vec::new();
        let total = 36 + 8 * children.len();
        push_sdt_header(&mut xsdt, b"XSDT", total as u32);
        for &child in children {
            push_u64(&mut xsdt, child);
        }
        xsdt
    }

    fn build_rsdt(children: &[u32]) -> Vec<u8> {
        let mut rsdt = Vec::new();
        let total = 36 + 4 * children.len();
        push_sdt_header(&mut rsdt, b"RSDT", total as u32);
        for &child in children {
            push_u32(&mut rsdt, child);
        }
        rsdt
    }

    /// A scan window with an RSDP on the second 16-byte boundary.
    fn build_scan_window(revision: u8, rsdt: u32, xsdt: u64) -> Vec<u8> {
        let mut window = vec![0u8; 256];
        let rsdp_off = 16;
        window[rsdp_off..rsdp_off + 8].copy_from_slice(b"RSD PTR ");
        window[rsdp_off + 8] = 0; // checksum
        window[rsdp_off + 9..rsdp_off + 15].copy_from_slice(b"RODNIX");
        window[rsdp_off + 15] = revision;
        window[rsdp_off + 16..rsdp_off + 20].copy_from_slice(&rsdt.to_le_bytes());
        if revision >= 2 {
            window[rsdp_off + 20..rsdp_off + 24].copy_from_slice(&36u32.to_le_bytes());
            window[rsdp_off + 24..rsdp_off + 32].copy_from_slice(&xsdt.to_le_bytes());
        }
        window
    }

    #[test]
    fn test_table_struct_sizes() {
        assert_eq!(core::mem::size_of::<Rsdp>(), 20);
        assert_eq!(core::mem::size_of::<RsdpExtended>(), 36);
        assert_eq!(core::mem::size_of::<SdtHeader>(), 36);
        assert_eq!(core::mem::size_of::<MadtHeader>(), 44);
        assert_eq!(core::mem::size_of::<MadtIoApicEntry>(), 12);
    }

    #[test]
    fn test_rsdp_scan_hits_16_byte_boundaries_only() {
        let mut window = vec![0u8; 128];
        // Signature off-boundary must not match.
        window[8..16].copy_from_slice(b"RSD PTR ");
        let base = window.as_ptr() as u64;
        assert_eq!(unsafe { find_rsdp(base, base + 128) }, None);

        // On-boundary match is found.
        window[32..40].copy_from_slice(b"RSD PTR ");
        assert_eq!(unsafe { find_rsdp(base, base + 128) }, Some(base + 32));
    }

    #[test]
    fn test_synthetic_xsdt_chain_finds_ioapic() {
        let madt = build_madt(0xFEC0_0000, 0);
        let xsdt = build_xsdt(&[madt.as_ptr() as u64]);
        let window = build_scan_window(2, 0, xsdt.as_ptr() as u64);

        let base = window.as_ptr() as u64;
        let record = unsafe { find_ioapic_from_madt(base, base + window.len() as u64) };
        assert_eq!(
            record,
            Some(IoApicRecord {
                id: 2,
                address: 0xFEC0_0000,
                gsi_base: 0
            })
        );
    }

    #[test]
    fn test_synthetic_rsdt_chain_finds_ioapic() {
        let madt = build_madt(0xFEC0_0000, 24);
        let rsdt = build_rsdt(&[madt.as_ptr() as u32]);
        let window = build_scan_window(0, rsdt.as_ptr() as u32, 0);

        let base = window.as_ptr() as u64;
        let record = unsafe { find_ioapic_from_madt(base, base + window.len() as u64) };
        assert_eq!(
            record,
            Some(IoApicRecord {
                id: 2,
                address: 0xFEC0_0000,
                gsi_base: 24
            })
        );
    }

    #[test]
    fn test_madt_walk_skips_other_record_types() {
        let madt = build_madt_with_leading_lapics(0xFEC1_0000);
        let record = unsafe { find_ioapic_in_madt(madt.as_ptr() as u64) };
        assert_eq!(record.map(|r| r.address), Some(0xFEC1_0000));
    }

    #[test]
    fn test_root_walk_skips_foreign_tables() {
        let madt = build_madt(0xFEC0_0000, 0);
        let mut hpet = Vec::new();
        push_sdt_header(&mut hpet, b"HPET", 36);
        let xsdt = build_xsdt(&[hpet.as_ptr() as u64, madt.as_ptr() as u64]);
        let window = build_scan_window(2, 0, xsdt.as_ptr() as u64);

        let base = window.as_ptr() as u64;
        let record = unsafe { find_ioapic_from_madt(base, base + window.len() as u64) };
        assert_eq!(record.map(|r| r.address), Some(0xFEC0_0000));
    }

    #[test]
    fn test_missing_rsdp_yields_none() {
        let window = vec![0u8; 256];
        let base = window.as_ptr() as u64;
        assert_eq!(
            unsafe { find_ioapic_from_madt(base, base + window.len() as u64) },
            None
        );
    }

    #[test]
    fn test_madt_without_ioapic_yields_none() {
        let mut madt = Vec::new();
        push_sdt_header(&mut madt, b"APIC", 44);
        push_u32(&mut madt, 0xFEE0_0000);
        push_u32(&mut madt, 1);
        assert_eq!(unsafe { find_ioapic_in_madt(madt.as_ptr() as u64) }, None);
    }
}
