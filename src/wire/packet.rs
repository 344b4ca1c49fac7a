use byteorder::{BigEndian, ByteOrder};

use super::sack::SelectiveAck;
use super::{field, Error, Result};

mod header_field {
    use super::field::Field;

    // high nibble of byte 0 = type, low nibble = version
    pub const TYPE_VERSION: usize = 0;
    pub const EXT: usize = 1;
    pub const CONNECTION_ID: Field = 2..4;
    pub const TIMESTAMP: Field = 4..8;
    pub const TIMESTAMP_DIFF: Field = 8..12;
    pub const WND_SIZE: Field = 12..16;
    pub const SEQ_NR: Field = 16..18;
    pub const ACK_NR: Field = 18..20;
}

pub const HEADER_LEN: usize = 20;

const VERSION: u8 = 1;

/// Extension type used on the wire for selective-ack (spec §3, §6).
pub const EXT_SELECTIVE_ACK: u8 = 1;

/// The five µTP packet types (spec §3). The 4-bit wire value is the
/// discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Fin = 1,
    State = 2,
    Reset = 3,
    Syn = 4,
}

impl PacketType {
    fn from_wire(value: u8) -> Result<PacketType> {
        match value {
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::Fin),
            2 => Ok(PacketType::State),
            3 => Ok(PacketType::Reset),
            4 => Ok(PacketType::Syn),
            _ => Err(Error("unknown packet type")),
        }
    }
}

/// A read/write wrapper around a µTP packet buffer (header + extensions +
/// payload). Mirrors the crate's other `Packet<T>` wrappers: accessors never
/// panic once [`Packet::check_len`] has succeeded.
#[derive(Debug, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Validate length, version, and type without walking extensions or
    /// allocating. Spec §2: datagrams under 20 bytes are dropped silently,
    /// so this is the first check the socket manager makes.
    pub fn check_len(&self) -> Result<()> {
        let data = self.buffer.as_ref();
        if data.len() < HEADER_LEN {
            return Err(Error("shorter than the fixed header"));
        }
        if self.version() != VERSION {
            return Err(Error("unsupported version"));
        }
        PacketType::from_wire(data[header_field::TYPE_VERSION] >> 4)?;
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn packet_type(&self) -> PacketType {
        let data = self.buffer.as_ref();
        // check_len() already proved this is one of the five known values.
        PacketType::from_wire(data[header_field::TYPE_VERSION] >> 4).unwrap()
    }

    pub fn version(&self) -> u8 {
        self.buffer.as_ref()[header_field::TYPE_VERSION] & 0x0f
    }

    pub fn first_extension(&self) -> u8 {
        self.buffer.as_ref()[header_field::EXT]
    }

    pub fn connection_id(&self) -> u16 {
        BigEndian::read_u16(&self.buffer.as_ref()[header_field::CONNECTION_ID])
    }

    pub fn timestamp_micros(&self) -> u32 {
        BigEndian::read_u32(&self.buffer.as_ref()[header_field::TIMESTAMP])
    }

    pub fn timestamp_diff_micros(&self) -> u32 {
        BigEndian::read_u32(&self.buffer.as_ref()[header_field::TIMESTAMP_DIFF])
    }

    pub fn window_size(&self) -> u32 {
        BigEndian::read_u32(&self.buffer.as_ref()[header_field::WND_SIZE])
    }

    pub fn seq_nr(&self) -> u16 {
        BigEndian::read_u16(&self.buffer.as_ref()[header_field::SEQ_NR])
    }

    pub fn ack_nr(&self) -> u16 {
        BigEndian::read_u16(&self.buffer.as_ref()[header_field::ACK_NR])
    }

    /// Offset of the payload, i.e. past the fixed header and every
    /// extension in the chain. `check_len` does not itself validate the
    /// chain; use [`Repr::parse`] for that.
    fn payload_offset(&self) -> Result<usize> {
        let data = self.buffer.as_ref();
        let mut next = self.first_extension();
        let mut offset = HEADER_LEN;
        while next != 0 {
            if offset + 2 > data.len() {
                return Err(Error("truncated extension"));
            }
            let len = data[offset + 1] as usize;
            if offset + 2 + len > data.len() {
                return Err(Error("truncated extension"));
            }
            next = data[offset];
            offset += 2 + len;
        }
        Ok(offset)
    }

    pub fn payload(&self) -> Result<&[u8]> {
        let offset = self.payload_offset()?;
        Ok(&self.buffer.as_ref()[offset..])
    }

    /// Walk the extension chain, yielding `(type, payload)` pairs.
    pub fn extensions(&self) -> ExtensionIter<'_> {
        ExtensionIter {
            data: self.buffer.as_ref(),
            next_type: self.first_extension(),
            offset: HEADER_LEN,
        }
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn set_packet_type(&mut self, value: PacketType) {
        let version = self.version();
        self.buffer.as_mut()[header_field::TYPE_VERSION] = ((value as u8) << 4) | version;
    }

    pub fn set_version(&mut self, value: u8) {
        let ty = self.buffer.as_ref()[header_field::TYPE_VERSION] >> 4;
        self.buffer.as_mut()[header_field::TYPE_VERSION] = (ty << 4) | (value & 0x0f);
    }

    pub fn set_first_extension(&mut self, value: u8) {
        self.buffer.as_mut()[header_field::EXT] = value;
    }

    pub fn set_connection_id(&mut self, value: u16) {
        BigEndian::write_u16(&mut self.buffer.as_mut()[header_field::CONNECTION_ID], value);
    }

    pub fn set_timestamp_micros(&mut self, value: u32) {
        BigEndian::write_u32(&mut self.buffer.as_mut()[header_field::TIMESTAMP], value);
    }

    pub fn set_timestamp_diff_micros(&mut self, value: u32) {
        BigEndian::write_u32(&mut self.buffer.as_mut()[header_field::TIMESTAMP_DIFF], value);
    }

    pub fn set_window_size(&mut self, value: u32) {
        BigEndian::write_u32(&mut self.buffer.as_mut()[header_field::WND_SIZE], value);
    }

    pub fn set_seq_nr(&mut self, value: u16) {
        BigEndian::write_u16(&mut self.buffer.as_mut()[header_field::SEQ_NR], value);
    }

    pub fn set_ack_nr(&mut self, value: u16) {
        BigEndian::write_u16(&mut self.buffer.as_mut()[header_field::ACK_NR], value);
    }

    pub fn payload_mut(&mut self) -> Result<&mut [u8]> {
        let offset = self.payload_offset()?;
        Ok(&mut self.buffer.as_mut()[offset..])
    }
}

/// Iterator over a packet's extension chain (spec §3: "a linked list; each
/// is `{next-type, length, payload}`; length-0 terminates only when
/// next-type is 0").
pub struct ExtensionIter<'a> {
    data: &'a [u8],
    next_type: u8,
    offset: usize,
}

impl<'a> Iterator for ExtensionIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<(u8, &'a [u8])> {
        if self.next_type == 0 {
            return None;
        }
        let ty = self.next_type;
        let len = *self.data.get(self.offset + 1)? as usize;
        let payload = self.data.get(self.offset + 2..self.offset + 2 + len)?;
        self.next_type = self.data[self.offset];
        self.offset += 2 + len;
        Some((ty, payload))
    }
}

/// The validated, owned representation of a packet: every header field plus
/// a parsed (not merely located) selective-ack extension, if present.
///
/// Parsing a `Repr` additionally validates the extension chain (codec rule
/// in spec §4.1): unknown extension types are skipped via their length
/// field, but a selective-ack extension whose length is not a multiple of 4
/// is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repr {
    pub packet_type: PacketType,
    pub connection_id: u16,
    pub timestamp_micros: u32,
    pub timestamp_diff_micros: u32,
    pub window_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
    pub selective_ack: Option<SelectiveAck>,
}

impl Repr {
    pub fn parse<T: AsRef<[u8]>>(packet: &Packet<T>) -> Result<Repr> {
        packet.check_len()?;

        let mut selective_ack = None;
        for (ty, payload) in packet.extensions() {
            if ty == EXT_SELECTIVE_ACK {
                selective_ack = Some(SelectiveAck::from_bytes(payload)?);
            }
            // Any other extension type is skipped using its length field
            // (spec §6) — `extensions()` already does that unconditionally.
        }
        // Force a full walk so a truncated trailing extension is caught
        // even when no selective-ack extension is present.
        let _ = packet.payload()?;

        Ok(Repr {
            packet_type: packet.packet_type(),
            connection_id: packet.connection_id(),
            timestamp_micros: packet.timestamp_micros(),
            timestamp_diff_micros: packet.timestamp_diff_micros(),
            window_size: packet.window_size(),
            seq_nr: packet.seq_nr(),
            ack_nr: packet.ack_nr(),
            selective_ack,
        })
    }

    /// Length of header + extension chain, excluding payload.
    pub fn header_len(&self) -> usize {
        match &self.selective_ack {
            Some(sack) => HEADER_LEN + 2 + sack.as_bytes().len(),
            None => HEADER_LEN,
        }
    }

    pub fn buffer_len(&self, payload_len: usize) -> usize {
        self.header_len() + payload_len
    }

    /// Emit header, extension chain, and payload into `buffer`, which must
    /// be exactly `self.buffer_len(payload.len())` bytes.
    pub fn emit(&self, buffer: &mut [u8], payload: &[u8]) {
        let mut packet = Packet::new_unchecked(buffer);
        packet.set_version(VERSION);
        packet.set_packet_type(self.packet_type);
        packet.set_connection_id(self.connection_id);
        packet.set_timestamp_micros(self.timestamp_micros);
        packet.set_timestamp_diff_micros(self.timestamp_diff_micros);
        packet.set_window_size(self.window_size);
        packet.set_seq_nr(self.seq_nr);
        packet.set_ack_nr(self.ack_nr);

        match &self.selective_ack {
            Some(sack) => {
                packet.set_first_extension(EXT_SELECTIVE_ACK);
                let bytes = sack.as_bytes();
                let ext_off = HEADER_LEN;
                buffer[ext_off] = 0; // terminates the chain
                buffer[ext_off + 1] = bytes.len() as u8;
                buffer[ext_off + 2..ext_off + 2 + bytes.len()].copy_from_slice(bytes);
            }
            None => packet.set_first_extension(0),
        }

        let payload_off = self.header_len();
        buffer[payload_off..payload_off + payload.len()].copy_from_slice(payload);
    }
}
