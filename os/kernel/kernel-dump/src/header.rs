//! # Kernel Dump Header
//!
//! Two byte-identical copies of a 512-byte header frame every dump: the
//! *leader* in front of the payload and the *trailer* right after it. A dump
//! whose trailer is missing, damaged or different from the leader is
//! incomplete and must be rejected by the reader.
//!
//! ## Layout
//!
//! All integers are big-endian.
//!
//! | offset | size | field |
//! |-------:|-----:|-------|
//! | 0   | 24  | magic, [`DUMP_MAGIC`] NUL padded |
//! | 24  | 16  | architecture name |
//! | 40  | 4   | format version, [`DUMP_VERSION`] |
//! | 44  | 4   | architecture version |
//! | 48  | 8   | dump length: payload bytes, headers excluded |
//! | 56  | 8   | creation time, seconds since the epoch |
//! | 64  | 4   | block size of the dump device |
//! | 68  | 64  | host name |
//! | 132 | 184 | kernel version string |
//! | 316 | 192 | panic string |
//! | 508 | 4   | parity |
//!
//! String fields are NUL terminated; longer inputs are cut at a UTF-8
//! character boundary without error.
//!
//! ## Parity
//!
//! The parity is the XOR of all 128 big-endian 32-bit words of the header
//! with the parity field set to zero. Consequently the XOR over all words of
//! a valid header, parity included, is zero.

use crate::DUMP_HEADER_SIZE;
use crate::error::HeaderError;

/// Magic of the dump header.
pub const DUMP_MAGIC: &str = "Kernel Minidump";

/// Version of the header layout.
pub const DUMP_VERSION: u32 = 1;

const MAGIC: (usize, usize) = (0, 24);
const ARCH: (usize, usize) = (24, 16);
const VERSION: usize = 40;
const ARCH_VERSION: usize = 44;
const DUMP_LENGTH: usize = 48;
const DUMP_TIME: usize = 56;
const BLOCK_SIZE: usize = 64;
const HOSTNAME: (usize, usize) = (68, 64);
const VERSION_STRING: (usize, usize) = (132, 184);
const PANIC_STRING: (usize, usize) = (316, 192);
const PARITY: usize = 508;

const _: () = assert!(PARITY + 4 == DUMP_HEADER_SIZE);
const _: () = assert!(PANIC_STRING.0 + PANIC_STRING.1 == PARITY);

/// Identification of the crashing system.
#[derive(Copy, Clone, Debug, Default)]
pub struct DumpIdentity<'a> {
    pub hostname: &'a str,
    pub version: &'a str,
    pub panic: Option<&'a str>,
    /// Seconds since the epoch.
    pub time: u64,
}

/// Fields needed to stamp a header besides the identity.
#[derive(Copy, Clone, Debug)]
pub struct HeaderParams<'a> {
    pub arch: &'a str,
    pub arch_version: u32,
    pub dump_length: u64,
    pub block_size: u32,
}

/// An encoded dump header.
#[derive(Clone, Eq, PartialEq)]
pub struct DumpHeader {
    bytes: [u8; DUMP_HEADER_SIZE],
}

impl DumpHeader {
    /// Build a header with a valid parity.
    #[must_use]
    pub fn new(params: &HeaderParams<'_>, ident: &DumpIdentity<'_>) -> Self {
        let mut h = Self {
            bytes: [0; DUMP_HEADER_SIZE],
        };
        h.put_str(MAGIC, DUMP_MAGIC);
        h.put_str(ARCH, params.arch);
        h.put_u32(VERSION, DUMP_VERSION);
        h.put_u32(ARCH_VERSION, params.arch_version);
        h.put_u64(DUMP_LENGTH, params.dump_length);
        h.put_u64(DUMP_TIME, ident.time);
        h.put_u32(BLOCK_SIZE, params.block_size);
        h.put_str(HOSTNAME, ident.hostname);
        h.put_str(VERSION_STRING, ident.version);
        if let Some(panic) = ident.panic {
            h.put_str(PANIC_STRING, panic);
        }
        let parity = h.compute_parity();
        h.put_u32(PARITY, parity);
        h
    }

    /// Decode and validate a header read from disk.
    ///
    /// # Errors
    /// - [`HeaderError::TooShort`] for fewer than 512 bytes.
    /// - [`HeaderError::BadMagic`] / [`HeaderError::BadVersion`] for foreign data.
    /// - [`HeaderError::BadParity`] if the stored parity does not match.
    pub fn parse(bytes: &[u8]) -> Result<Self, HeaderError> {
        let raw = bytes.get(..DUMP_HEADER_SIZE).ok_or(HeaderError::TooShort)?;
        let mut h = Self {
            bytes: [0; DUMP_HEADER_SIZE],
        };
        h.bytes.copy_from_slice(raw);

        if h.get_str(MAGIC) != Ok(DUMP_MAGIC) {
            return Err(HeaderError::BadMagic);
        }
        if h.version() != DUMP_VERSION {
            return Err(HeaderError::BadVersion(h.version()));
        }
        let computed = h.compute_parity();
        if computed != h.parity() {
            return Err(HeaderError::BadParity {
                stored: h.parity(),
                computed,
            });
        }
        Ok(h)
    }

    /// Reject a leader/trailer pair that is not byte-identical.
    ///
    /// # Errors
    /// [`HeaderError::Mismatch`].
    pub fn validate_pair(leader: &Self, trailer: &Self) -> Result<(), HeaderError> {
        if leader.bytes == trailer.bytes {
            Ok(())
        } else {
            Err(HeaderError::Mismatch)
        }
    }

    /// Parity over the header with the parity field taken as zero.
    #[must_use]
    pub fn compute_parity(&self) -> u32 {
        parity(&self.bytes) ^ self.parity()
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DUMP_HEADER_SIZE] {
        &self.bytes
    }

    /// Architecture name.
    ///
    /// # Errors
    /// [`HeaderError::BadString`] if the field is not UTF-8.
    pub fn arch(&self) -> Result<&str, HeaderError> {
        self.get_str(ARCH)
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.get_u32(VERSION)
    }

    #[must_use]
    pub fn arch_version(&self) -> u32 {
        self.get_u32(ARCH_VERSION)
    }

    #[must_use]
    pub fn dump_length(&self) -> u64 {
        self.get_u64(DUMP_LENGTH)
    }

    #[must_use]
    pub fn dump_time(&self) -> u64 {
        self.get_u64(DUMP_TIME)
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.get_u32(BLOCK_SIZE)
    }

    /// # Errors
    /// [`HeaderError::BadString`] if the field is not UTF-8.
    pub fn hostname(&self) -> Result<&str, HeaderError> {
        self.get_str(HOSTNAME)
    }

    /// # Errors
    /// [`HeaderError::BadString`] if the field is not UTF-8.
    pub fn version_string(&self) -> Result<&str, HeaderError> {
        self.get_str(VERSION_STRING)
    }

    /// # Errors
    /// [`HeaderError::BadString`] if the field is not UTF-8.
    pub fn panic_string(&self) -> Result<&str, HeaderError> {
        self.get_str(PANIC_STRING)
    }

    #[must_use]
    pub fn parity(&self) -> u32 {
        self.get_u32(PARITY)
    }

    fn put_u32(&mut self, off: usize, v: u32) {
        self.bytes[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, off: usize, v: u64) {
        self.bytes[off..off + 8].copy_from_slice(&v.to_be_bytes());
    }

    /// Copy `s` leaving at least one NUL, cut at a character boundary.
    fn put_str(&mut self, (off, len): (usize, usize), s: &str) {
        let mut n = s.len().min(len - 1);
        while !s.is_char_boundary(n) {
            n -= 1;
        }
        let field = &mut self.bytes[off..off + len];
        field.fill(0);
        field[..n].copy_from_slice(&s.as_bytes()[..n]);
    }

    fn get_u32(&self, off: usize) -> u32 {
        let mut v = [0u8; 4];
        v.copy_from_slice(&self.bytes[off..off + 4]);
        u32::from_be_bytes(v)
    }

    fn get_u64(&self, off: usize) -> u64 {
        let mut v = [0u8; 8];
        v.copy_from_slice(&self.bytes[off..off + 8]);
        u64::from_be_bytes(v)
    }

    fn get_str(&self, (off, len): (usize, usize)) -> Result<&str, HeaderError> {
        let field = &self.bytes[off..off + len];
        let end = field.iter().position(|&b| b == 0).unwrap_or(len);
        core::str::from_utf8(&field[..end]).map_err(|_| HeaderError::BadString)
    }
}

impl core::fmt::Debug for DumpHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DumpHeader")
            .field("arch", &self.arch())
            .field("dump_length", &self.dump_length())
            .field("dump_time", &self.dump_time())
            .field("block_size", &self.block_size())
            .field("hostname", &self.hostname())
            .field("parity", &format_args!("{:#010x}", self.parity()))
            .finish_non_exhaustive()
    }
}

/// XOR of the big-endian 32-bit words of `bytes`.
#[must_use]
pub fn parity(bytes: &[u8; DUMP_HEADER_SIZE]) -> u32 {
    bytes.chunks_exact(4).fold(0, |acc, w| {
        acc ^ u32::from_be_bytes([w[0], w[1], w[2], w[3]])
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> DumpHeader {
        DumpHeader::new(
            &HeaderParams {
                arch: "amd64",
                arch_version: 2,
                dump_length: 7 * 4096,
                block_size: 512,
            },
            &DumpIdentity {
                hostname: "crashbox",
                version: "kernel 0.0.0 #1",
                panic: Some("page fault in kernel mode"),
                time: 1_700_000_000,
            },
        )
    }

    #[test]
    fn fields_are_stored() {
        let h = sample();
        assert_eq!(h.arch(), Ok("amd64"));
        assert_eq!(h.version(), DUMP_VERSION);
        assert_eq!(h.arch_version(), 2);
        assert_eq!(h.dump_length(), 7 * 4096);
        assert_eq!(h.dump_time(), 1_700_000_000);
        assert_eq!(h.block_size(), 512);
        assert_eq!(h.hostname(), Ok("crashbox"));
        assert_eq!(h.version_string(), Ok("kernel 0.0.0 #1"));
        assert_eq!(h.panic_string(), Ok("page fault in kernel mode"));
        // big-endian on disk
        assert_eq!(&h.as_bytes()[48..56], &(7u64 * 4096).to_be_bytes());
    }

    #[test]
    fn parity_is_self_consistent() {
        let h = sample();
        let mut zeroed = *h.as_bytes();
        zeroed[PARITY..].fill(0);
        assert_eq!(parity(&zeroed), h.parity());
        assert_eq!(parity(h.as_bytes()), 0);
        assert_eq!(h.compute_parity(), h.parity());
    }

    #[test]
    fn parse_accepts_own_output() {
        let h = sample();
        let back = DumpHeader::parse(h.as_bytes()).unwrap();
        assert_eq!(back, h);
        assert!(DumpHeader::validate_pair(&h, &back).is_ok());
    }

    #[test]
    fn parse_rejects_damage() {
        let h = sample();
        let mut bytes = *h.as_bytes();
        bytes[200] ^= 0x40;
        assert!(matches!(
            DumpHeader::parse(&bytes),
            Err(HeaderError::BadParity { .. })
        ));

        let mut bytes = *h.as_bytes();
        bytes[0] = b'X';
        assert_eq!(DumpHeader::parse(&bytes), Err(HeaderError::BadMagic));

        assert_eq!(DumpHeader::parse(&bytes[..100]), Err(HeaderError::TooShort));
    }

    #[test]
    fn differing_copies_are_rejected() {
        let a = sample();
        let b = DumpHeader::new(
            &HeaderParams {
                arch: "amd64",
                arch_version: 2,
                dump_length: 8 * 4096,
                block_size: 512,
            },
            &DumpIdentity::default(),
        );
        assert_eq!(DumpHeader::validate_pair(&a, &b), Err(HeaderError::Mismatch));
    }

    #[test]
    fn long_strings_are_truncated_silently() {
        let long = "x".repeat(500);
        let h = DumpHeader::new(
            &HeaderParams {
                arch: "an-architecture-name-too-long",
                arch_version: 0,
                dump_length: 0,
                block_size: 512,
            },
            &DumpIdentity {
                hostname: &long,
                version: &long,
                panic: Some(&long),
                time: 0,
            },
        );
        assert_eq!(h.arch(), Ok("an-architecture"));
        assert_eq!(h.hostname().unwrap().len(), 63);
        assert_eq!(h.version_string().unwrap().len(), 183);
        assert_eq!(h.panic_string().unwrap().len(), 191);
        assert!(DumpHeader::parse(h.as_bytes()).is_ok());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 22 two-byte characters (44 bytes) into a 16-byte field
        let name = "é".repeat(22);
        let h = DumpHeader::new(
            &HeaderParams {
                arch: &name,
                arch_version: 0,
                dump_length: 0,
                block_size: 512,
            },
            &DumpIdentity::default(),
        );
        assert_eq!(h.arch(), Ok("ééééééé"));
    }
}
