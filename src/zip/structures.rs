use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::{MergeError, MergeResult};

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }
}

/// General purpose flag: entry is encrypted.
pub const FLAG_ENCRYPTED: u16 = 0x0001;
/// General purpose flag: sizes and CRC follow the data in a descriptor.
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
/// General purpose flag: name and comment are UTF-8.
pub const FLAG_UTF8: u16 = 0x0800;

/// Extra field id of the ZIP64 extended information record.
pub const ZIP64_EXTRA_ID: u16 = 0x0001;
/// Value a 32-bit field takes when the real value lives in ZIP64 records.
pub const ZIP64_MARKER_32: u32 = 0xFFFF_FFFF;
pub const ZIP64_MARKER_16: u16 = 0xFFFF;

/// "Version made by" host byte for unix.
pub const HOST_UNIX: u8 = 3;
/// DOS directory attribute bit.
pub const DOS_DIRECTORY: u8 = 0x10;

pub const VERSION_DEFAULT: u16 = 20;
pub const VERSION_ZIP64: u16 = 45;

/// End of Central Directory (EOCD) - 22 bytes minimum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn from_bytes(data: &[u8]) -> MergeResult<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(MergeError::InvalidArchive(
                "invalid end of central directory record".into(),
            ));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_number: cursor.read_u16::<LittleEndian>()?,
            disk_with_cd: cursor.read_u16::<LittleEndian>()?,
            disk_entries: cursor.read_u16::<LittleEndian>()?,
            total_entries: cursor.read_u16::<LittleEndian>()?,
            cd_size: cursor.read_u32::<LittleEndian>()?,
            cd_offset: cursor.read_u32::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    /// Encode the fixed part; the comment bytes follow separately.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(Self::SIGNATURE);
        // Writes into a Vec cannot fail.
        let _ = out.write_u16::<LittleEndian>(self.disk_number);
        let _ = out.write_u16::<LittleEndian>(self.disk_with_cd);
        let _ = out.write_u16::<LittleEndian>(self.disk_entries);
        let _ = out.write_u16::<LittleEndian>(self.total_entries);
        let _ = out.write_u32::<LittleEndian>(self.cd_size);
        let _ = out.write_u32::<LittleEndian>(self.cd_offset);
        let _ = out.write_u16::<LittleEndian>(self.comment_len);
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_entries == ZIP64_MARKER_16
            || self.total_entries == ZIP64_MARKER_16
            || self.cd_size == ZIP64_MARKER_32
            || self.cd_offset == ZIP64_MARKER_32
    }

    pub fn is_multi_disk(&self) -> bool {
        self.disk_number != 0 || self.disk_with_cd != 0
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zip64EOCDLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    pub fn from_bytes(data: &[u8]) -> MergeResult<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(MergeError::InvalidArchive("invalid ZIP64 locator".into()));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_with_eocd64: cursor.read_u32::<LittleEndian>()?,
            eocd64_offset: cursor.read_u64::<LittleEndian>()?,
            total_disks: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(Self::SIGNATURE);
        let _ = out.write_u32::<LittleEndian>(self.disk_with_eocd64);
        let _ = out.write_u64::<LittleEndian>(self.eocd64_offset);
        let _ = out.write_u32::<LittleEndian>(self.total_disks);
    }
}

/// ZIP64 End of Central Directory - 56 bytes minimum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zip64EOCD {
    pub eocd64_size: u64,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub disk_with_cd: u32,
    pub disk_entries: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;

    /// A single-disk record describing `entries` entries.
    pub fn new(entries: u64, cd_size: u64, cd_offset: u64) -> Self {
        Self {
            // Size of the remaining record, excluding signature and this field.
            eocd64_size: (Self::MIN_SIZE - 12) as u64,
            version_made_by: VERSION_ZIP64,
            version_needed: VERSION_ZIP64,
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: entries,
            total_entries: entries,
            cd_size,
            cd_offset,
        }
    }

    pub fn from_bytes(data: &[u8]) -> MergeResult<Self> {
        if data.len() < Self::MIN_SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(MergeError::InvalidArchive(
                "invalid ZIP64 end of central directory record".into(),
            ));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            eocd64_size: cursor.read_u64::<LittleEndian>()?,
            version_made_by: cursor.read_u16::<LittleEndian>()?,
            version_needed: cursor.read_u16::<LittleEndian>()?,
            disk_number: cursor.read_u32::<LittleEndian>()?,
            disk_with_cd: cursor.read_u32::<LittleEndian>()?,
            disk_entries: cursor.read_u64::<LittleEndian>()?,
            total_entries: cursor.read_u64::<LittleEndian>()?,
            cd_size: cursor.read_u64::<LittleEndian>()?,
            cd_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(Self::SIGNATURE);
        let _ = out.write_u64::<LittleEndian>(self.eocd64_size);
        let _ = out.write_u16::<LittleEndian>(self.version_made_by);
        let _ = out.write_u16::<LittleEndian>(self.version_needed);
        let _ = out.write_u32::<LittleEndian>(self.disk_number);
        let _ = out.write_u32::<LittleEndian>(self.disk_with_cd);
        let _ = out.write_u64::<LittleEndian>(self.disk_entries);
        let _ = out.write_u64::<LittleEndian>(self.total_entries);
        let _ = out.write_u64::<LittleEndian>(self.cd_size);
        let _ = out.write_u64::<LittleEndian>(self.cd_offset);
    }
}

/// Central Directory File Header (CDFH) - 46 bytes minimum
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";
pub const CDFH_MIN_SIZE: usize = 46;

/// Local File Header (LFH) - 30 bytes
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// MS-DOS packed modification date and time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosDateTime {
    pub date: u16,
    pub time: u16,
}

impl Default for DosDateTime {
    /// 1980-01-01 00:00:00, the earliest representable instant.
    fn default() -> Self {
        Self {
            date: (1 << 5) | 1,
            time: 0,
        }
    }
}

impl DosDateTime {
    /// Pack a calendar time; the year is clamped to 1980..=2107 and seconds
    /// lose their lowest bit.
    pub fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        let year = year.clamp(1980, 2107) - 1980;
        Self {
            date: (year << 9) | (u16::from(month & 0x0F) << 5) | u16::from(day & 0x1F),
            time: (u16::from(hour & 0x1F) << 11)
                | (u16::from(minute & 0x3F) << 5)
                | u16::from((second / 2) & 0x1F),
        }
    }

    /// Parse modification date to (year, month, day)
    pub fn date_parts(&self) -> (u16, u8, u8) {
        let day = (self.date & 0x1F) as u8;
        let month = ((self.date >> 5) & 0x0F) as u8;
        let year = ((self.date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// Parse modification time to (hour, minute, second)
    pub fn time_parts(&self) -> (u8, u8, u8) {
        let second = ((self.time & 0x1F) * 2) as u8;
        let minute = ((self.time >> 5) & 0x3F) as u8;
        let hour = ((self.time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }
}

/// Metadata of one archive member, independent of where its bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub name: String,
    pub method: CompressionMethod,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub is_directory: bool,
    pub modified: DosDateTime,
    /// Unix permission and type bits, when the creator was a unix host.
    pub unix_mode: Option<u32>,
    pub dos_attributes: u8,
    pub comment: String,
}

impl EntryHeader {
    /// Header for an empty directory entry; `name` should end with `/`.
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: CompressionMethod::Stored,
            compressed_size: 0,
            uncompressed_size: 0,
            crc32: 0,
            is_directory: true,
            modified: DosDateTime::default(),
            unix_mode: None,
            dos_attributes: DOS_DIRECTORY,
            comment: String::new(),
        }
    }

    /// The 32-bit external attributes field.
    pub fn external_attributes(&self) -> u32 {
        let dos = u32::from(self.dos_attributes)
            | if self.is_directory {
                u32::from(DOS_DIRECTORY)
            } else {
                0
            };
        match self.unix_mode {
            Some(mode) => (mode << 16) | dos,
            None => dos,
        }
    }
}

/// A central directory record: entry metadata plus its location.
#[derive(Debug, Clone)]
pub struct CentralEntry {
    pub header: EntryHeader,
    pub flags: u16,
    pub lfh_offset: u64,
}

impl CentralEntry {
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dos_time_packs_and_unpacks() {
        let t = DosDateTime::new(2020, 1, 9, 2, 37, 32);
        assert_eq!(t.date_parts(), (2020, 1, 9));
        assert_eq!(t.time_parts(), (2, 37, 32));
        assert_eq!(DosDateTime::default().date_parts(), (1980, 1, 1));
    }

    #[test]
    fn eocd_encodes_to_parseable_bytes() {
        let eocd = EndOfCentralDirectory {
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: 3,
            total_entries: 3,
            cd_size: 0x8000_0010,
            cd_offset: 0xF000_0000,
            comment_len: 0,
        };
        let mut bytes = Vec::new();
        eocd.write_to(&mut bytes);
        assert_eq!(bytes.len(), EndOfCentralDirectory::SIZE);
        let parsed = EndOfCentralDirectory::from_bytes(&bytes).unwrap();
        // Sizes above 2^31 must survive as unsigned values.
        assert_eq!(parsed.cd_offset, 0xF000_0000);
        assert_eq!(parsed, eocd);
    }

    #[test]
    fn zip64_record_size_field_excludes_leading_twelve_bytes() {
        let mut bytes = Vec::new();
        Zip64EOCD::new(70_000, 1 << 33, 1 << 34).write_to(&mut bytes);
        assert_eq!(bytes.len(), Zip64EOCD::MIN_SIZE);
        let parsed = Zip64EOCD::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.eocd64_size, 44);
        assert_eq!(parsed.total_entries, 70_000);
        assert_eq!(parsed.cd_offset, 1 << 34);
    }

    #[test]
    fn external_attributes_carry_unix_mode() {
        let mut header = EntryHeader::directory("d/");
        header.unix_mode = Some(0o40755);
        assert_eq!(header.external_attributes(), (0o40755 << 16) | 0x10);
    }
}
