use crate::{ComponentIdentifier, DMX_ADDRESS_COUNT};

use super::{
    DATA_HEADER_SIZE, DATA_PACKET_MIN_SIZE, DATA_PACKET_MTU, DMP_OFFSET, FRAMING_OFFSET,
    OPTS_OFFSET, OPTVAL_FORCE_SYNC, OPTVAL_PREVIEW, OPTVAL_TERMINATED, PRI_OFFSET,
    PROPERTY_VALUE_COUNT_OFFSET, PacketError, SEQ_OFFSET, SOURCE_NAME_OFFSET, UDP_PREAMBLE_SIZE,
    VECTOR_E131_DATA_PACKET, root, source_name_from_str, source_name_to_string,
    write_flags_and_length,
};

const DMP_VECTOR_SET_PROPERTY: u8 = 0x02;
const DMP_ADDRESS_AND_DATA_TYPE: u8 = 0xA1;

/// A parsed E1.31 data packet (framing + DMP layers).
///
/// Slot data borrows from the receive buffer; everything else is copied out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket<'a> {
    /// User assigned name of the source.
    pub source_name: String,
    /// Universe priority (0..=200).
    pub priority: u8,
    /// Synchronization address (0 when synchronization is unused).
    pub sync_address: u16,
    /// Sequence number.
    pub sequence: u8,
    /// E1.31 6.2.6 preview flag.
    pub preview: bool,
    /// E1.31 6.2.6 stream terminated flag.
    pub terminated: bool,
    /// E1.31 6.2.6 force synchronization flag.
    pub force_sync: bool,
    /// Universe number.
    pub universe: u16,
    /// DMX512-A start code.
    pub start_code: u8,
    /// Slot data following the start code.
    pub slots: &'a [u8],
}

/// Parses the framing and DMP layers of a data packet.
///
/// `buf` is the root layer payload, starting at the framing layer.
pub fn parse_data_packet(buf: &[u8]) -> Result<DataPacket<'_>, PacketError> {
    if buf.len() < DATA_PACKET_MIN_SIZE {
        return Err(PacketError::InvalidLength(buf.len()));
    }

    // E1.31 6.2.1 Data Packet: Vector
    let vector = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
    if vector != VECTOR_E131_DATA_PACKET {
        return Err(PacketError::InvalidFramingLayerVector(vector));
    }

    // E1.31 7.2-7.5: DMP vector and fixed fields
    if buf[79] != DMP_VECTOR_SET_PROPERTY
        || buf[80] != DMP_ADDRESS_AND_DATA_TYPE
        || u16::from_be_bytes([buf[81], buf[82]]) != 0x0000
        || u16::from_be_bytes([buf[83], buf[84]]) != 0x0001
    {
        return Err(PacketError::InvalidDmpLayer);
    }

    // E1.31 7.6 Property Value Count includes the start code slot.
    let property_count = u16::from_be_bytes([buf[85], buf[86]]);
    if property_count == 0 || property_count as usize > 1 + DMX_ADDRESS_COUNT {
        return Err(PacketError::SlotCountOutOfRange(property_count));
    }
    let address_count = (property_count - 1) as usize;
    if DATA_PACKET_MIN_SIZE + address_count > buf.len() {
        return Err(PacketError::SlotCountOutOfRange(property_count));
    }

    let options = buf[74];
    Ok(DataPacket {
        source_name: source_name_to_string(&buf[6..70]),
        priority: buf[70],
        sync_address: u16::from_be_bytes([buf[71], buf[72]]),
        sequence: buf[73],
        preview: options & OPTVAL_PREVIEW != 0,
        terminated: options & OPTVAL_TERMINATED != 0,
        force_sync: options & OPTVAL_FORCE_SYNC != 0,
        universe: u16::from_be_bytes([buf[75], buf[76]]),
        start_code: buf[87],
        slots: &buf[DATA_PACKET_MIN_SIZE..DATA_PACKET_MIN_SIZE + address_count],
    })
}

/// A packet-ready data packet send buffer.
///
/// Formatted once at creation; every later change patches bytes in place so
/// the buffer can be handed to the socket layer without re-packing.
#[derive(Clone)]
pub struct DataSendBuf {
    buf: [u8; DATA_PACKET_MTU],
}

impl DataSendBuf {
    /// Formats a complete zero-slot data packet.
    pub fn new(
        cid: &ComponentIdentifier,
        source_name: &str,
        priority: u8,
        universe: u16,
        sync_address: u16,
        preview: bool,
        start_code: u8,
    ) -> Result<Self, PacketError> {
        let name = source_name_from_str(source_name)?;

        let mut buf = [0u8; DATA_PACKET_MTU];
        let mut at = root::pack_root_layer(
            &mut buf,
            DATA_HEADER_SIZE - UDP_PREAMBLE_SIZE,
            false,
            cid,
        );

        // Framing layer
        write_flags_and_length(&mut buf, at, DATA_HEADER_SIZE - FRAMING_OFFSET);
        at += 2;
        buf[at..at + 4].copy_from_slice(&VECTOR_E131_DATA_PACKET.to_be_bytes());
        at += 4;
        buf[at..at + 64].copy_from_slice(&name);
        at += 64;
        buf[at] = priority;
        at += 1;
        // Sync address accepted but always packed as zero; synchronization is
        // not implemented.
        let _ = sync_address;
        buf[at..at + 2].copy_from_slice(&0u16.to_be_bytes());
        at += 2;
        buf[at] = 0; // sequence
        at += 1;
        buf[at] = if preview { OPTVAL_PREVIEW } else { 0 };
        at += 1;
        buf[at..at + 2].copy_from_slice(&universe.to_be_bytes());
        at += 2;

        // DMP layer
        write_flags_and_length(&mut buf, at, DATA_HEADER_SIZE - DMP_OFFSET);
        at += 2;
        buf[at] = DMP_VECTOR_SET_PROPERTY;
        at += 1;
        buf[at] = DMP_ADDRESS_AND_DATA_TYPE;
        at += 1;
        buf[at..at + 2].copy_from_slice(&0u16.to_be_bytes()); // first property address
        at += 2;
        buf[at..at + 2].copy_from_slice(&1u16.to_be_bytes()); // address increment
        at += 2;
        buf[at..at + 2].copy_from_slice(&1u16.to_be_bytes()); // property count (start code only)
        at += 2;
        buf[at] = start_code;

        Ok(Self { buf })
    }

    pub fn sequence(&self) -> u8 {
        self.buf[SEQ_OFFSET]
    }

    pub fn set_sequence(&mut self, seq: u8) {
        self.buf[SEQ_OFFSET] = seq;
    }

    pub fn terminated(&self) -> bool {
        self.buf[OPTS_OFFSET] & OPTVAL_TERMINATED != 0
    }

    pub fn set_terminated(&mut self, terminated: bool) {
        if terminated {
            self.buf[OPTS_OFFSET] |= OPTVAL_TERMINATED;
        } else {
            self.buf[OPTS_OFFSET] &= !OPTVAL_TERMINATED;
        }
    }

    pub fn set_preview(&mut self, preview: bool) {
        if preview {
            self.buf[OPTS_OFFSET] |= OPTVAL_PREVIEW;
        } else {
            self.buf[OPTS_OFFSET] &= !OPTVAL_PREVIEW;
        }
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.buf[PRI_OFFSET] = priority;
    }

    /// Rewrites the source name field in place.
    pub fn set_source_name(&mut self, source_name: &str) -> Result<(), PacketError> {
        let name = source_name_from_str(source_name)?;
        self.buf[SOURCE_NAME_OFFSET..SOURCE_NAME_OFFSET + 64].copy_from_slice(&name);
        Ok(())
    }

    /// Replaces the slot payload and updates every length field.
    pub fn set_data(&mut self, data: &[u8]) {
        let count = data.len().min(DMX_ADDRESS_COUNT);
        self.set_slot_count(count);
        self.buf[DATA_HEADER_SIZE..DATA_HEADER_SIZE + count].copy_from_slice(&data[..count]);
    }

    fn set_slot_count(&mut self, count: usize) {
        write_flags_and_length(&mut self.buf, UDP_PREAMBLE_SIZE, DATA_HEADER_SIZE + count - UDP_PREAMBLE_SIZE);
        write_flags_and_length(&mut self.buf, FRAMING_OFFSET, DATA_HEADER_SIZE + count - FRAMING_OFFSET);
        write_flags_and_length(&mut self.buf, DMP_OFFSET, DATA_HEADER_SIZE + count - DMP_OFFSET);
        let property_count = (1 + count) as u16;
        self.buf[PROPERTY_VALUE_COUNT_OFFSET..PROPERTY_VALUE_COUNT_OFFSET + 2]
            .copy_from_slice(&property_count.to_be_bytes());
    }

    /// Number of data slots currently declared.
    pub fn slot_count(&self) -> usize {
        let property_count = u16::from_be_bytes([
            self.buf[PROPERTY_VALUE_COUNT_OFFSET],
            self.buf[PROPERTY_VALUE_COUNT_OFFSET + 1],
        ]);
        (property_count as usize).saturating_sub(1)
    }

    pub fn slots(&self) -> &[u8] {
        &self.buf[DATA_HEADER_SIZE..DATA_HEADER_SIZE + self.slot_count()]
    }

    pub fn slot(&self, index: usize) -> u8 {
        self.buf[DATA_HEADER_SIZE + index]
    }

    pub fn set_slot(&mut self, index: usize, value: u8) {
        self.buf[DATA_HEADER_SIZE + index] = value;
    }

    /// The packed datagram, preamble through the last declared slot.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..root::packed_len(&self.buf)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{RootLayerPdus, parse_udp_preamble};
    use uuid::Uuid;

    fn parse_back(buf: &DataSendBuf) -> (ComponentIdentifier, DataPacket<'_>) {
        let block = parse_udp_preamble(buf.as_slice()).unwrap();
        let root = RootLayerPdus::new(block).next().unwrap();
        (root.cid, parse_data_packet(root.data).unwrap())
    }

    #[test]
    fn data_packet_round_trips() {
        let cid = Uuid::new_v4();
        let mut send =
            DataSendBuf::new(&cid, "Test Source", 150, 42, 0, true, crate::STARTCODE_DMX).unwrap();
        send.set_sequence(17);
        send.set_data(&[1, 2, 3, 4]);

        let (parsed_cid, packet) = parse_back(&send);
        assert_eq!(parsed_cid, cid);
        assert_eq!(packet.source_name, "Test Source");
        assert_eq!(packet.priority, 150);
        assert_eq!(packet.sequence, 17);
        assert!(packet.preview);
        assert!(!packet.terminated);
        assert_eq!(packet.universe, 42);
        assert_eq!(packet.start_code, crate::STARTCODE_DMX);
        assert_eq!(packet.slots, &[1, 2, 3, 4]);
    }

    #[test]
    fn zero_slots_is_valid() {
        let send = DataSendBuf::new(&Uuid::new_v4(), "s", 100, 1, 0, false, 0).unwrap();
        assert_eq!(send.as_slice().len(), DATA_HEADER_SIZE);

        let (_, packet) = parse_back(&send);
        assert!(packet.slots.is_empty());
    }

    #[test]
    fn terminated_flag_round_trips() {
        let mut send = DataSendBuf::new(&Uuid::new_v4(), "s", 100, 1, 0, false, 0).unwrap();
        send.set_terminated(true);
        let (_, packet) = parse_back(&send);
        assert!(packet.terminated);

        send.set_terminated(false);
        let (_, packet) = parse_back(&send);
        assert!(!packet.terminated);
    }

    #[test]
    fn short_packet_rejected() {
        let buf = [0u8; DATA_PACKET_MIN_SIZE - 1];
        assert!(parse_data_packet(&buf).is_err());
    }

    #[test]
    fn slot_count_past_datagram_rejected() {
        let mut send = DataSendBuf::new(&Uuid::new_v4(), "s", 100, 1, 0, false, 0).unwrap();
        send.set_data(&[0; 16]);
        let datagram = send.as_slice().to_vec();

        // Claim more slots than the datagram carries.
        let mut truncated = datagram.clone();
        truncated[PROPERTY_VALUE_COUNT_OFFSET + 1] = 100;
        assert!(parse_data_packet(&truncated[FRAMING_OFFSET..]).is_err());
    }

    #[test]
    fn slot_count_513_rejected() {
        let mut buf = vec![0u8; DATA_PACKET_MIN_SIZE + 600];
        let send = DataSendBuf::new(&Uuid::new_v4(), "s", 100, 1, 0, false, 0).unwrap();
        buf[..DATA_HEADER_SIZE].copy_from_slice(&send.as_slice()[..DATA_HEADER_SIZE]);
        let framing = &mut buf[FRAMING_OFFSET..];
        framing[85..87].copy_from_slice(&514u16.to_be_bytes()); // 513 slots + start code
        assert!(parse_data_packet(&buf[FRAMING_OFFSET..]).is_err());
    }

    #[test]
    fn priority_and_name_patch_in_place() {
        let mut send = DataSendBuf::new(&Uuid::new_v4(), "before", 99, 1, 0, false, 0).unwrap();
        send.set_priority(200);
        send.set_source_name("after").unwrap();
        let (_, packet) = parse_back(&send);
        assert_eq!(packet.priority, 200);
        assert_eq!(packet.source_name, "after");
    }
}
