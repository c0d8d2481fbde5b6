use byteorder::BigEndian;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use serde::Deserialize;
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use strum::IntoEnumIterator;
use strum_macros::EnumIter;
use strum_macros::EnumString;

use crate::Result;
use crate::error::WscaptureError;

pub static PCAP_MAGIC_MICROS: u32 = 0xa1b2c3d4;
pub static FILE_HEADER_LEN: usize = 24;
pub static RECORD_HEADER_LEN: usize = 16;
/// libpcap's ceiling for Ethernet, used when a header carries snaplen 0.
pub static MAX_SNAPLEN: u32 = 262144;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PcapByteOrder {
    BigEndian,
    LittleEndian,
    WiresharkDefault, // LittleEndian
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, EnumIter, Serialize, Deserialize)]
pub enum LinkType {
    NULL = 0,
    ETHERNET = 1,
    RAW = 101,
    LOOP = 108,
    LINUXSLL = 113,
    IPV4 = 228,
    IPV6 = 229,
    LINUXSLL2 = 276,
}

impl LinkType {
    pub fn to_u32(self) -> u32 {
        self as u32
    }
    pub fn from_u32(value: u32) -> Option<Self> {
        LinkType::iter().find(|&e| e as u32 == value)
    }
}

// File Header
// from https://www.ietf.org/archive/id/draft-gharris-opsawg-pcap-01.html#name-file-header
//
//                         1                   2                   3
//     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//  0 |                          Magic Number                         |
//    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//  4 |          Major Version        |         Minor Version         |
//    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//  8 |                       Timezone (thiszone)                     |
//    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// 12 |                            Sigfigs                            |
//    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// 16 |                            SnapLen                            |
//    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// 20 |                            LinkType                           |
//    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    /// Magic Number (32 bits):
    /// 0xA1B2C3D4 means record time stamps are in seconds and microseconds.
    /// Readers tell the byte order of the whole file from how this value reads back.
    pub magic_number: u32,
    /// Major Version (16 bits), always 2.
    pub major_version: u16,
    /// Minor Version (16 bits), always 4.
    pub minor_version: u16,
    /// Offset from GMT, written as 0.
    pub thiszone: i32,
    /// Time stamp accuracy, written as 0.
    pub sigfigs: u32,
    /// SnapLen (32 bits):
    /// Maximum number of octets captured from each packet.
    pub snaplen: u32,
    /// LinkType (32 bits):
    /// Link layer type of every packet in the file.
    pub linktype: LinkType,
}

impl FileHeader {
    pub fn new(snaplen: u32) -> FileHeader {
        FileHeader {
            magic_number: PCAP_MAGIC_MICROS,
            major_version: 2,
            minor_version: 4,
            thiszone: 0,
            sigfigs: 0,
            snaplen,
            linktype: LinkType::ETHERNET,
        }
    }
    fn encode<B: ByteOrder>(&self) -> Result<Vec<u8>, WscaptureError> {
        let mut buf = Vec::with_capacity(FILE_HEADER_LEN);
        buf.write_u32::<B>(self.magic_number)?;
        buf.write_u16::<B>(self.major_version)?;
        buf.write_u16::<B>(self.minor_version)?;
        buf.write_i32::<B>(self.thiszone)?;
        buf.write_u32::<B>(self.sigfigs)?;
        buf.write_u32::<B>(self.snaplen)?;
        buf.write_u32::<B>(self.linktype.to_u32())?;
        Ok(buf)
    }
    pub fn to_bytes(&self, pbo: PcapByteOrder) -> Result<Vec<u8>, WscaptureError> {
        match pbo {
            PcapByteOrder::LittleEndian | PcapByteOrder::WiresharkDefault => {
                self.encode::<LittleEndian>()
            }
            PcapByteOrder::BigEndian => self.encode::<BigEndian>(),
        }
    }
    pub fn write<W: Write>(&self, fs: &mut W, pbo: PcapByteOrder) -> Result<(), WscaptureError> {
        let buf = self.to_bytes(pbo)?;
        fs.write_all(&buf)?;
        Ok(())
    }
    fn decode<B: ByteOrder, R: Read>(
        fs: &mut R,
        magic_number: u32,
    ) -> Result<FileHeader, WscaptureError> {
        let major_version = fs.read_u16::<B>()?;
        let minor_version = fs.read_u16::<B>()?;
        let thiszone = fs.read_i32::<B>()?;
        let sigfigs = fs.read_u32::<B>()?;
        let snaplen = fs.read_u32::<B>()?;
        let linktype_value = fs.read_u32::<B>()?;
        let linktype = match LinkType::from_u32(linktype_value) {
            Some(l) => l,
            None => {
                return Err(WscaptureError::UnknownLinkType {
                    linktype: linktype_value,
                });
            }
        };
        Ok(FileHeader {
            magic_number,
            major_version,
            minor_version,
            thiszone,
            sigfigs,
            snaplen,
            linktype,
        })
    }
    /// Read the header, detecting the byte order from the magic number.
    pub fn read<R: Read>(fs: &mut R) -> Result<(FileHeader, PcapByteOrder), WscaptureError> {
        let mut magic = [0u8; 4];
        fs.read_exact(&mut magic)?;
        if BigEndian::read_u32(&magic) == PCAP_MAGIC_MICROS {
            let header = Self::decode::<BigEndian, R>(fs, PCAP_MAGIC_MICROS)?;
            Ok((header, PcapByteOrder::BigEndian))
        } else if LittleEndian::read_u32(&magic) == PCAP_MAGIC_MICROS {
            let header = Self::decode::<LittleEndian, R>(fs, PCAP_MAGIC_MICROS)?;
            Ok((header, PcapByteOrder::LittleEndian))
        } else {
            Err(WscaptureError::InvalidMagicNumber {
                magic: BigEndian::read_u32(&magic),
            })
        }
    }
}

// Packet Record
// from https://www.ietf.org/archive/id/draft-gharris-opsawg-pcap-01.html#name-packet-record
//                         1                   2                   3
//     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//  0 |                      Timestamp (Seconds)                      |
//    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//  4 |                   Timestamp (Microseconds)                    |
//    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//  8 |                    Captured Packet Length                     |
//    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// 12 |                    Original Packet Length                     |
//    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// 16 /                                                               /
//    /                          Packet Data                          /
//    /                        variable length                        /
//    /                                                               /
//    +---------------------------------------------------------------+

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketRecord {
    pub ts_sec: u32,
    pub ts_usec: u32,
    /// Number of octets stored in the file for this packet.
    pub captured_packet_length: u32,
    /// Length of the packet as it would have been on the wire.
    /// Synthetic segments are never truncated, so this equals the captured length.
    pub original_packet_length: u32,
    pub packet_data: Vec<u8>,
}

impl PacketRecord {
    /// `ts` is the capture time since the UNIX epoch.
    pub fn new(ts: Duration, packet_data: &[u8]) -> PacketRecord {
        // u32 is pcap file struct defined data type, it runs out in 2106
        let ts_sec = u32::try_from(ts.as_secs()).unwrap_or(u32::MAX);
        let ts_usec = ts.subsec_micros();
        let len = packet_data.len() as u32;
        PacketRecord {
            ts_sec,
            ts_usec,
            captured_packet_length: len,
            original_packet_length: len,
            packet_data: packet_data.to_vec(),
        }
    }
    pub fn timestamp(&self) -> Duration {
        Duration::new(self.ts_sec as u64, self.ts_usec * 1000)
    }
    /// Total bytes this record occupies in the file.
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_LEN + self.packet_data.len()
    }
    fn encode<B: ByteOrder>(&self) -> Result<Vec<u8>, WscaptureError> {
        let mut buf = Vec::with_capacity(self.record_len());
        buf.write_u32::<B>(self.ts_sec)?;
        buf.write_u32::<B>(self.ts_usec)?;
        buf.write_u32::<B>(self.captured_packet_length)?;
        buf.write_u32::<B>(self.original_packet_length)?;
        buf.write_all(&self.packet_data)?;
        Ok(buf)
    }
    pub fn to_bytes(&self, pbo: PcapByteOrder) -> Result<Vec<u8>, WscaptureError> {
        match pbo {
            PcapByteOrder::LittleEndian | PcapByteOrder::WiresharkDefault => {
                self.encode::<LittleEndian>()
            }
            PcapByteOrder::BigEndian => self.encode::<BigEndian>(),
        }
    }
    /// Header and data go to the sink in a single `write_all`.
    pub fn write<W: Write>(&self, fs: &mut W, pbo: PcapByteOrder) -> Result<(), WscaptureError> {
        let buf = self.to_bytes(pbo)?;
        fs.write_all(&buf)?;
        Ok(())
    }
    fn decode<B: ByteOrder, R: Read>(
        fs: &mut R,
        snaplen: u32,
    ) -> Result<PacketRecord, WscaptureError> {
        let ts_sec = fs.read_u32::<B>()?;
        let ts_usec = fs.read_u32::<B>()?;
        let captured_packet_length = fs.read_u32::<B>()?;
        let original_packet_length = fs.read_u32::<B>()?;
        let limit = if snaplen == 0 { MAX_SNAPLEN } else { snaplen };
        if captured_packet_length > limit {
            return Err(WscaptureError::RecordTooLong {
                caplen: captured_packet_length,
                limit,
            });
        }
        let mut data = vec![0u8; captured_packet_length as usize]; // read only capt_len length
        fs.read_exact(&mut data)?;
        Ok(PacketRecord {
            ts_sec,
            ts_usec,
            captured_packet_length,
            original_packet_length,
            packet_data: data,
        })
    }
    /// Read one record, refusing any that claims more than `snaplen` bytes.
    pub fn read<R: Read>(
        fs: &mut R,
        pbo: PcapByteOrder,
        snaplen: u32,
    ) -> Result<PacketRecord, WscaptureError> {
        match pbo {
            PcapByteOrder::LittleEndian | PcapByteOrder::WiresharkDefault => {
                Self::decode::<LittleEndian, R>(fs, snaplen)
            }
            PcapByteOrder::BigEndian => Self::decode::<BigEndian, R>(fs, snaplen),
        }
    }
}

/// A whole capture read back into memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pcap {
    pub header: FileHeader,
    pub byte_order: PcapByteOrder,
    pub records: Vec<PacketRecord>,
}

impl Pcap {
    /// Reads every complete record. A truncated trailing record, which is what a
    /// sink failure in the middle of a write leaves behind, ends the read quietly.
    pub fn read_all<R: Read>(fs: &mut R) -> Result<Pcap, WscaptureError> {
        let (header, byte_order) = FileHeader::read(fs)?;
        let mut records = Vec::new();
        loop {
            match PacketRecord::read(fs, byte_order, header.snaplen) {
                Ok(r) => records.push(r),
                Err(WscaptureError::IOError(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }
        Ok(Pcap {
            header,
            byte_order,
            records,
        })
    }
    pub fn read_path<P: AsRef<Path>>(path: P) -> Result<Pcap, WscaptureError> {
        let fs = File::open(path)?;
        let mut reader = BufReader::new(fs);
        Self::read_all(&mut reader)
    }
}
