//! The signature container format.
//!
//! Zero or more signature records are appended after an arbitrary payload,
//! so several independent signers can attach to the same bytes without ever
//! re-encoding them. Records are only appended to or excised from the tail
//! region; earlier bytes are never rewritten. Indexing is 1-based in
//! discovery order, scanning forward from a caller-chosen offset.
//!
//! # Record format
//!
//! The 32-bit record (48-byte header) is:
//!
//! ```text
//! +-------+------------+---------+---------+-------+----------+=====+=====+
//! | Magic | RecordLen  | SigLen  | UidLen  | Flags | Reserved | Uid | Sig |
//! | SGR1  | u32        | u32     | u32     | u32   | 28 bytes |     |     |
//! +-------+------------+---------+---------+-------+----------+=====+=====+
//! ```
//!
//! The 64-bit record (60-byte header, for payloads of 4 GiB and up) widens
//! the two length fields:
//!
//! ```text
//! +-------+------------+---------+---------+-------+----------+=====+=====+
//! | Magic | RecordLen  | SigLen  | UidLen  | Flags | Reserved | Uid | Sig |
//! | SGR8  | u64        | u64     | u32     | u32   | 32 bytes |     |     |
//! +-------+------------+---------+---------+-------+----------+=====+=====+
//! ```
//!
//! All integers are little-endian. `RecordLen` covers the header, the signer
//! id, and the signature. Which header applies is fixed by the entry point
//! called; the magics differ only so that a 64-bit extract can never
//! mis-parse a 32-bit record as its own.
//!
//! # Legacy fixed-slot carrier
//!
//! Small hardware carriers (512 bytes and up) use a completely separate
//! layout: a single 30-byte digest slot at byte offset 256 followed by a
//! CRC-16 of those 30 bytes at offset 286. A 32-byte digest stored this way
//! gives up its last 2 bytes: they are defined to equal the CRC and are
//! excluded from every comparison.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use subtle::ConstantTimeEq;

use crate::error::CryptoError;
use crate::keystore::MAX_USER_ID_LEN;

/// Header size of a 32-bit signature record.
pub const HEADER_LEN_32: usize = 48;
/// Header size of a 64-bit signature record.
pub const HEADER_LEN_64: usize = 60;

const MAGIC_32: &[u8; 4] = b"SGR1";
const MAGIC_64: &[u8; 4] = b"SGR8";

/// Minimum carrier size for the legacy fixed-slot layout.
pub const LEGACY_MIN_CARRIER: usize = 512;
/// Offset of the 30-byte digest slot in a legacy carrier.
pub const LEGACY_DIGEST_OFFSET: usize = 256;
/// Bytes of digest actually stored in a legacy carrier.
pub const LEGACY_DIGEST_LEN: usize = 30;
/// Offset of the 2-byte checksum in a legacy carrier.
pub const LEGACY_CRC_OFFSET: usize = 286;

const FILE_SCAN_CHUNK: usize = 64 * 1024;

/// One signature record recovered from a container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureRecord {
    pub signature: Vec<u8>,
    pub signer_id: String,
    /// Total record size in bytes (header + signer id + signature).
    pub record_len: usize,
    /// Byte offset of the record's header within the scanned region.
    pub offset: u64,
}

/// CRC-16/CCITT-FALSE, used by key carriers, directories, and the legacy
/// token slot.
pub(crate) fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

fn check_signer_id(signer_id: &str) -> Result<(), CryptoError> {
    if signer_id.is_empty()
        || signer_id.len() > MAX_USER_ID_LEN
        || !signer_id.bytes().all(|b| (0x20..0x7f).contains(&b))
    {
        return Err(CryptoError::BadUser);
    }
    Ok(())
}

/// Encode a single 32-bit signature record.
pub(crate) fn record_bytes(signature: &[u8], signer_id: &str) -> Result<Vec<u8>, CryptoError> {
    check_signer_id(signer_id)?;
    let record_len = HEADER_LEN_32 + signer_id.len() + signature.len();
    let mut out = vec![0u8; HEADER_LEN_32];
    out[0..4].copy_from_slice(MAGIC_32);
    LittleEndian::write_u32(&mut out[4..8], record_len as u32);
    LittleEndian::write_u32(&mut out[8..12], signature.len() as u32);
    LittleEndian::write_u32(&mut out[12..16], signer_id.len() as u32);
    out.extend_from_slice(signer_id.as_bytes());
    out.extend_from_slice(signature);
    Ok(out)
}

fn record_bytes_64(signature: &[u8], signer_id: &str) -> Result<Vec<u8>, CryptoError> {
    check_signer_id(signer_id)?;
    let record_len = HEADER_LEN_64 + signer_id.len() + signature.len();
    let mut out = vec![0u8; HEADER_LEN_64];
    out[0..4].copy_from_slice(MAGIC_64);
    LittleEndian::write_u64(&mut out[4..12], record_len as u64);
    LittleEndian::write_u64(&mut out[12..20], signature.len() as u64);
    LittleEndian::write_u32(&mut out[20..24], signer_id.len() as u32);
    out.extend_from_slice(signer_id.as_bytes());
    out.extend_from_slice(signature);
    Ok(out)
}

/// Append a signature record to a payload buffer. Never rewrites earlier
/// bytes.
pub fn embed(payload: &mut Vec<u8>, signature: &[u8], signer_id: &str) -> Result<(), CryptoError> {
    let record = record_bytes(signature, signer_id)?;
    payload.extend_from_slice(&record);
    Ok(())
}

/// 64-bit length variant of [`embed`].
pub fn embed64(
    payload: &mut Vec<u8>,
    signature: &[u8],
    signer_id: &str,
) -> Result<(), CryptoError> {
    let record = record_bytes_64(signature, signer_id)?;
    payload.extend_from_slice(&record);
    Ok(())
}

// Parse a candidate header at `at`. Returns (record_len, uid_len, sig_len)
// when every field is internally consistent, None when this magic hit is
// just payload bytes.
fn parse_header_32(buf: &[u8], at: usize) -> Option<(usize, usize, usize)> {
    let header = buf.get(at..at + HEADER_LEN_32)?;
    if &header[0..4] != MAGIC_32 {
        return None;
    }
    let record_len = LittleEndian::read_u32(&header[4..8]) as usize;
    let sig_len = LittleEndian::read_u32(&header[8..12]) as usize;
    let uid_len = LittleEndian::read_u32(&header[12..16]) as usize;
    if uid_len == 0 || uid_len > MAX_USER_ID_LEN {
        return None;
    }
    if record_len != HEADER_LEN_32 + uid_len + sig_len {
        return None;
    }
    if at + record_len > buf.len() {
        return None;
    }
    Some((record_len, uid_len, sig_len))
}

fn parse_header_64(buf: &[u8], at: usize) -> Option<(usize, usize, usize)> {
    let header = buf.get(at..at + HEADER_LEN_64)?;
    if &header[0..4] != MAGIC_64 {
        return None;
    }
    let record_len = LittleEndian::read_u64(&header[4..12]) as usize;
    let sig_len = LittleEndian::read_u64(&header[12..20]) as usize;
    let uid_len = LittleEndian::read_u32(&header[20..24]) as usize;
    if uid_len == 0 || uid_len > MAX_USER_ID_LEN {
        return None;
    }
    if record_len != HEADER_LEN_64 + uid_len + sig_len {
        return None;
    }
    if at + record_len > buf.len() {
        return None;
    }
    Some((record_len, uid_len, sig_len))
}

fn find_magic(buf: &[u8], from: usize, magic: &[u8; 4]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    (from..=buf.len() - 4).find(|&i| &buf[i..i + 4] == magic)
}

fn extract_inner(
    buf: &[u8],
    search_from: usize,
    n: usize,
    header_len: usize,
    magic: &[u8; 4],
    parse: fn(&[u8], usize) -> Option<(usize, usize, usize)>,
) -> Result<SignatureRecord, CryptoError> {
    if n == 0 {
        return Err(CryptoError::BadFormat("record index is 1-based"));
    }
    let mut pos = search_from;
    let mut found = 0usize;
    while let Some(at) = find_magic(buf, pos, magic) {
        match parse(buf, at) {
            Some((record_len, uid_len, sig_len)) => {
                found += 1;
                if found == n {
                    let uid = &buf[at + header_len..at + header_len + uid_len];
                    let signer_id = std::str::from_utf8(uid)
                        .map_err(|_| CryptoError::BadUser)?
                        .to_string();
                    let sig_start = at + header_len + uid_len;
                    return Ok(SignatureRecord {
                        signature: buf[sig_start..sig_start + sig_len].to_vec(),
                        signer_id,
                        record_len,
                        offset: at as u64,
                    });
                }
                pos = at + record_len;
            }
            // A magic hit that doesn't parse is payload bytes; keep going.
            None => pos = at + 1,
        }
    }
    Err(CryptoError::NoSignature)
}

/// Find the `n`-th signature record (1-based) scanning forward from
/// `search_from`.
pub fn extract(buf: &[u8], search_from: usize, n: usize) -> Result<SignatureRecord, CryptoError> {
    extract_inner(buf, search_from, n, HEADER_LEN_32, MAGIC_32, parse_header_32)
}

/// 64-bit length variant of [`extract`].
pub fn extract64(buf: &[u8], search_from: usize, n: usize) -> Result<SignatureRecord, CryptoError> {
    extract_inner(buf, search_from, n, HEADER_LEN_64, MAGIC_64, parse_header_64)
}

/// Physically excise the `n`-th record. Every later record shifts left, so
/// previously computed indices and offsets must be re-derived by the caller.
pub fn remove_nth(buf: &mut Vec<u8>, n: usize) -> Result<(), CryptoError> {
    let record = extract(buf, 0, n)?;
    let start = record.offset as usize;
    buf.drain(start..start + record.record_len);
    Ok(())
}

/// 64-bit length variant of [`remove_nth`].
pub fn remove_nth64(buf: &mut Vec<u8>, n: usize) -> Result<(), CryptoError> {
    let record = extract64(buf, 0, n)?;
    let start = record.offset as usize;
    buf.drain(start..start + record.record_len);
    Ok(())
}

/// Append a signature record to a file. Identical output to [`embed`] on
/// the file's bytes.
pub fn embed_file(path: &Path, signature: &[u8], signer_id: &str) -> Result<(), CryptoError> {
    let record = record_bytes(signature, signer_id)?;
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(&record)?;
    file.sync_data()?;
    Ok(())
}

/// 64-bit length variant of [`embed_file`].
pub fn embed_file64(path: &Path, signature: &[u8], signer_id: &str) -> Result<(), CryptoError> {
    let record = record_bytes_64(signature, signer_id)?;
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(&record)?;
    file.sync_data()?;
    Ok(())
}

fn read_window(file: &mut File, pos: u64, len: usize) -> Result<Vec<u8>, CryptoError> {
    file.seek(SeekFrom::Start(pos))?;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

// Length fields of a candidate file record, widened to u64 so both header
// versions share one scan loop.
struct FileHeader {
    record_len: u64,
    sig_len: u64,
    uid_len: usize,
}

fn file_header_32(header: &[u8]) -> FileHeader {
    FileHeader {
        record_len: LittleEndian::read_u32(&header[4..8]) as u64,
        sig_len: LittleEndian::read_u32(&header[8..12]) as u64,
        uid_len: LittleEndian::read_u32(&header[12..16]) as usize,
    }
}

fn file_header_64(header: &[u8]) -> FileHeader {
    FileHeader {
        record_len: LittleEndian::read_u64(&header[4..12]),
        sig_len: LittleEndian::read_u64(&header[12..20]),
        uid_len: LittleEndian::read_u32(&header[20..24]) as usize,
    }
}

fn extract_file_inner(
    path: &Path,
    search_from: u64,
    n: usize,
    header_len: usize,
    magic: &[u8; 4],
    read_header: fn(&[u8]) -> FileHeader,
) -> Result<SignatureRecord, CryptoError> {
    if n == 0 {
        return Err(CryptoError::BadFormat("record index is 1-based"));
    }
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut pos = search_from;
    let mut found = 0usize;
    while pos + 4 <= file_len {
        let window_len = FILE_SCAN_CHUNK.min((file_len - pos) as usize);
        let window = read_window(&mut file, pos, window_len)?;
        let Some(rel) = find_magic(&window, 0, magic) else {
            if pos + window_len as u64 >= file_len {
                break;
            }
            // Overlap by 3 so a magic split across chunks is still seen.
            pos += (window_len - 3) as u64;
            continue;
        };
        let at = pos + rel as u64;
        // Re-read from the candidate so the header and body never straddle
        // the scan window.
        let header = read_window(&mut file, at, header_len)?;
        if header.len() < header_len {
            break;
        }
        let fields = read_header(&header);
        let consistent = fields.uid_len > 0
            && fields.uid_len <= MAX_USER_ID_LEN
            && fields.record_len == (header_len + fields.uid_len) as u64 + fields.sig_len
            && at + fields.record_len <= file_len;
        if !consistent {
            pos = at + 1;
            continue;
        }
        found += 1;
        if found == n {
            let body_len = fields.uid_len + fields.sig_len as usize;
            let body = read_window(&mut file, at + header_len as u64, body_len)?;
            if body.len() < body_len {
                return Err(CryptoError::BadFormat("signature record truncated"));
            }
            let signer_id = std::str::from_utf8(&body[..fields.uid_len])
                .map_err(|_| CryptoError::BadUser)?
                .to_string();
            return Ok(SignatureRecord {
                signature: body[fields.uid_len..].to_vec(),
                signer_id,
                record_len: fields.record_len as usize,
                offset: at,
            });
        }
        pos = at + fields.record_len;
    }
    Err(CryptoError::NoSignature)
}

/// Streaming file variant of [`extract`]: scans the file in chunks rather
/// than loading it into memory.
pub fn extract_file(path: &Path, search_from: u64, n: usize) -> Result<SignatureRecord, CryptoError> {
    extract_file_inner(path, search_from, n, HEADER_LEN_32, MAGIC_32, file_header_32)
}

/// 64-bit length variant of [`extract_file`], for signed payloads too large
/// to pass through [`extract`].
pub fn extract_file64(
    path: &Path,
    search_from: u64,
    n: usize,
) -> Result<SignatureRecord, CryptoError> {
    extract_file_inner(path, search_from, n, HEADER_LEN_64, MAGIC_64, file_header_64)
}

/// Streaming file variant of [`remove_nth`]: rewrites the file without the
/// record through a temporary sibling, then renames it into place.
pub fn remove_nth_file(path: &Path, n: usize) -> Result<(), CryptoError> {
    let record = extract_file(path, 0, n)?;
    excise_record_file(path, &record)
}

/// 64-bit length variant of [`remove_nth_file`].
pub fn remove_nth_file64(path: &Path, n: usize) -> Result<(), CryptoError> {
    let record = extract_file64(path, 0, n)?;
    excise_record_file(path, &record)
}

fn excise_record_file(path: &Path, record: &SignatureRecord) -> Result<(), CryptoError> {
    let tmp_path = path.with_extension("kptmp");
    {
        let mut src = File::open(path)?;
        let mut dst = File::create(&tmp_path)?;
        let file_len = src.metadata()?.len();
        copy_range(&mut src, &mut dst, 0, record.offset)?;
        copy_range(
            &mut src,
            &mut dst,
            record.offset + record.record_len as u64,
            file_len,
        )?;
        dst.sync_data()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn copy_range(src: &mut File, dst: &mut File, from: u64, to: u64) -> Result<(), CryptoError> {
    src.seek(SeekFrom::Start(from))?;
    let mut remaining = to - from;
    let mut buf = vec![0u8; FILE_SCAN_CHUNK];
    while remaining > 0 {
        let want = FILE_SCAN_CHUNK.min(remaining as usize);
        src.read_exact(&mut buf[..want])?;
        dst.write_all(&buf[..want])?;
        remaining -= want as u64;
    }
    Ok(())
}

/// Store a 32-byte digest in a legacy fixed-slot carrier. Only the first 30
/// bytes are kept; the checksum takes the place of the last 2. A carrier
/// below the 512-byte minimum cannot hold the slot and fails with
/// `BufferTooSmall`.
pub fn write_legacy_digest(carrier: &mut [u8], digest: &[u8; 32]) -> Result<(), CryptoError> {
    if carrier.len() < LEGACY_MIN_CARRIER {
        return Err(CryptoError::BufferTooSmall {
            required: LEGACY_MIN_CARRIER,
        });
    }
    carrier[LEGACY_DIGEST_OFFSET..LEGACY_DIGEST_OFFSET + LEGACY_DIGEST_LEN]
        .copy_from_slice(&digest[..LEGACY_DIGEST_LEN]);
    let crc = crc16(&digest[..LEGACY_DIGEST_LEN]);
    carrier[LEGACY_CRC_OFFSET..LEGACY_CRC_OFFSET + 2].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Read a digest back from a legacy carrier. The returned value's last 2
/// bytes are the stored checksum, per the format's definition.
pub fn read_legacy_digest(carrier: &[u8]) -> Result<[u8; 32], CryptoError> {
    if carrier.len() < LEGACY_MIN_CARRIER {
        return Err(CryptoError::BadLength {
            step: "legacy carrier read",
            expected: LEGACY_MIN_CARRIER,
            actual: carrier.len(),
        });
    }
    let stored = &carrier[LEGACY_DIGEST_OFFSET..LEGACY_DIGEST_OFFSET + LEGACY_DIGEST_LEN];
    let crc_bytes = &carrier[LEGACY_CRC_OFFSET..LEGACY_CRC_OFFSET + 2];
    let expected = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let actual = crc16(stored);
    if expected != actual {
        return Err(CryptoError::BadCrc { expected, actual });
    }
    let mut digest = [0u8; 32];
    digest[..LEGACY_DIGEST_LEN].copy_from_slice(stored);
    digest[LEGACY_DIGEST_LEN..].copy_from_slice(crc_bytes);
    Ok(digest)
}

/// Compare two digests under legacy-carrier rules: the last 2 bytes are
/// excluded. Constant time over the compared span.
pub fn legacy_digest_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a[..LEGACY_DIGEST_LEN].ct_eq(&b[..LEGACY_DIGEST_LEN]).into()
}
