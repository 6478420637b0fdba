use crate::ComponentIdentifier;

use super::{
    FRAMING_OFFSET, MAX_UNIVERSES_PER_PAGE, MTU, PacketError, SEQ_OFFSET, SOURCE_NAME_OFFSET,
    UDP_PREAMBLE_SIZE, UNIVERSE_DISCOVERY_HEADER_SIZE, UNIVERSE_DISCOVERY_LAST_PAGE_OFFSET,
    UNIVERSE_DISCOVERY_OFFSET, UNIVERSE_DISCOVERY_PAGE_OFFSET, VECTOR_E131_EXTENDED_DISCOVERY,
    VECTOR_UNIVERSE_DISCOVERY_UNIVERSE_LIST, pdu_length, root, source_name_from_str,
    source_name_to_string, write_flags_and_length,
};

/// Extracts the framing layer vector of an extended packet.
///
/// `buf` is the root layer payload, starting at the framing layer.
pub fn parse_framing_vector(buf: &[u8]) -> Result<u32, PacketError> {
    if buf.len() < 6 {
        return Err(PacketError::InvalidLength(buf.len()));
    }
    Ok(u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]))
}

/// A parsed universe discovery packet (framing + universe discovery layers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryLayer<'a> {
    /// Source name from the framing layer.
    pub source_name: String,
    /// Page number, starting at 0.
    pub page: u8,
    /// Final page number.
    pub last_page: u8,
    universes: &'a [u8],
}

impl DiscoveryLayer<'_> {
    /// The universe ids carried on this page, in wire order.
    pub fn universes(&self) -> impl Iterator<Item = u16> + '_ {
        self.universes.chunks_exact(2).map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
    }

    pub fn num_universes(&self) -> usize {
        self.universes.len() / 2
    }
}

/// Parses a universe discovery packet.
///
/// `buf` is the root layer payload, starting at the framing layer; the
/// framing vector must already have been checked to be
/// [`VECTOR_E131_EXTENDED_DISCOVERY`].
pub fn parse_discovery_layer(buf: &[u8]) -> Result<DiscoveryLayer<'_>, PacketError> {
    let layer_offset = UNIVERSE_DISCOVERY_OFFSET - FRAMING_OFFSET;
    if buf.len() < layer_offset + 8 {
        return Err(PacketError::InvalidLength(buf.len()));
    }

    let layer = &buf[layer_offset..];
    let length = pdu_length(layer, 0);
    if length < 8 || length > layer.len() {
        return Err(PacketError::InvalidLength(length));
    }

    let vector = u32::from_be_bytes([layer[2], layer[3], layer[4], layer[5]]);
    if vector != VECTOR_UNIVERSE_DISCOVERY_UNIVERSE_LIST {
        return Err(PacketError::InvalidUniverseDiscoveryLayerVector(vector));
    }

    let universe_bytes = (length - 8) & !1;
    Ok(DiscoveryLayer {
        source_name: source_name_to_string(&buf[6..70]),
        page: layer[6],
        last_page: layer[7],
        universes: &layer[8..8 + universe_bytes],
    })
}

/// A packet-ready universe discovery send buffer.
///
/// Holds one page at a time; the source engine rewrites the universe list,
/// page fields and sequence byte between pages.
#[derive(Clone)]
pub struct DiscoverySendBuf {
    buf: [u8; MTU],
}

impl DiscoverySendBuf {
    /// Formats a complete zero-universe discovery packet.
    pub fn new(cid: &ComponentIdentifier, source_name: &str) -> Result<Self, PacketError> {
        let name = source_name_from_str(source_name)?;

        let mut buf = [0u8; MTU];
        let mut at = root::pack_root_layer(
            &mut buf,
            UNIVERSE_DISCOVERY_HEADER_SIZE - UDP_PREAMBLE_SIZE,
            true,
            cid,
        );

        // Framing layer
        write_flags_and_length(&mut buf, at, UNIVERSE_DISCOVERY_HEADER_SIZE - FRAMING_OFFSET);
        at += 2;
        buf[at..at + 4].copy_from_slice(&VECTOR_E131_EXTENDED_DISCOVERY.to_be_bytes());
        at += 4;
        buf[at..at + 64].copy_from_slice(&name);
        at += 64;
        buf[at..at + 4].copy_from_slice(&[0; 4]); // reserved
        at += 4;

        // Universe discovery layer
        write_flags_and_length(&mut buf, at, UNIVERSE_DISCOVERY_HEADER_SIZE - UNIVERSE_DISCOVERY_OFFSET);
        at += 2;
        buf[at..at + 4].copy_from_slice(&VECTOR_UNIVERSE_DISCOVERY_UNIVERSE_LIST.to_be_bytes());
        at += 4;
        buf[at] = 0; // page
        buf[at + 1] = 0; // last page

        Ok(Self { buf })
    }

    pub fn set_page(&mut self, page: u8) {
        self.buf[UNIVERSE_DISCOVERY_PAGE_OFFSET] = page;
    }

    pub fn set_last_page(&mut self, last_page: u8) {
        self.buf[UNIVERSE_DISCOVERY_LAST_PAGE_OFFSET] = last_page;
    }

    /// Bumps the framing-layer sequence byte between pages.
    pub fn increment_sequence(&mut self) {
        self.buf[SEQ_OFFSET] = self.buf[SEQ_OFFSET].wrapping_add(1);
    }

    /// Rewrites the source name field in place.
    pub fn set_source_name(&mut self, source_name: &str) -> Result<(), PacketError> {
        let name = source_name_from_str(source_name)?;
        self.buf[SOURCE_NAME_OFFSET..SOURCE_NAME_OFFSET + 64].copy_from_slice(&name);
        Ok(())
    }

    /// Replaces this page's universe list and updates every length field.
    pub fn set_universes(&mut self, universes: &[u16]) {
        let count = universes.len().min(MAX_UNIVERSES_PER_PAGE);
        for (i, universe) in universes[..count].iter().enumerate() {
            let at = UNIVERSE_DISCOVERY_HEADER_SIZE + i * 2;
            self.buf[at..at + 2].copy_from_slice(&universe.to_be_bytes());
        }

        let total = UNIVERSE_DISCOVERY_HEADER_SIZE + count * 2;
        write_flags_and_length(&mut self.buf, UDP_PREAMBLE_SIZE, total - UDP_PREAMBLE_SIZE);
        write_flags_and_length(&mut self.buf, FRAMING_OFFSET, total - FRAMING_OFFSET);
        write_flags_and_length(&mut self.buf, UNIVERSE_DISCOVERY_OFFSET, total - UNIVERSE_DISCOVERY_OFFSET);
    }

    /// The packed datagram, preamble through the last universe id.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..root::packed_len(&self.buf)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{RootLayerPdus, parse_udp_preamble};
    use uuid::Uuid;

    fn parse_back(buf: &DiscoverySendBuf) -> (u32, DiscoveryLayer<'_>) {
        let block = parse_udp_preamble(buf.as_slice()).unwrap();
        let root = RootLayerPdus::new(block).next().unwrap();
        let vector = parse_framing_vector(root.data).unwrap();
        (vector, parse_discovery_layer(root.data).unwrap())
    }

    #[test]
    fn discovery_page_round_trips() {
        let mut send = DiscoverySendBuf::new(&Uuid::new_v4(), "Console").unwrap();
        send.set_universes(&[1, 2, 3, 100]);
        send.set_page(0);
        send.set_last_page(0);

        let (vector, layer) = parse_back(&send);
        assert_eq!(vector, VECTOR_E131_EXTENDED_DISCOVERY);
        assert_eq!(layer.source_name, "Console");
        assert_eq!(layer.page, 0);
        assert_eq!(layer.last_page, 0);
        assert_eq!(layer.universes().collect::<Vec<_>>(), vec![1, 2, 3, 100]);
    }

    #[test]
    fn paging_covers_ordered_list() {
        // 700 universes span two pages with the last-page marker set.
        let universes: Vec<u16> = (1..=700).collect();
        let last_page = ((universes.len() - 1) / MAX_UNIVERSES_PER_PAGE) as u8;
        assert_eq!(last_page, 1);

        let mut send = DiscoverySendBuf::new(&Uuid::new_v4(), "s").unwrap();
        let mut collected = Vec::new();
        for (page, chunk) in universes.chunks(MAX_UNIVERSES_PER_PAGE).enumerate() {
            send.set_universes(chunk);
            send.set_page(page as u8);
            send.set_last_page(last_page);

            let (_, layer) = parse_back(&send);
            assert_eq!(layer.page, page as u8);
            assert_eq!(layer.last_page, 1);
            collected.extend(layer.universes());
        }
        assert_eq!(collected, universes);
    }

    #[test]
    fn empty_page_round_trips() {
        let mut send = DiscoverySendBuf::new(&Uuid::new_v4(), "s").unwrap();
        send.set_universes(&[]);
        let (_, layer) = parse_back(&send);
        assert_eq!(layer.num_universes(), 0);
        assert_eq!(send.as_slice().len(), UNIVERSE_DISCOVERY_HEADER_SIZE);
    }

    #[test]
    fn bad_layer_vector_rejected() {
        let mut send = DiscoverySendBuf::new(&Uuid::new_v4(), "s").unwrap();
        send.set_universes(&[1]);
        let mut datagram = send.as_slice().to_vec();
        datagram[UNIVERSE_DISCOVERY_OFFSET + 5] = 9;
        assert!(parse_discovery_layer(&datagram[FRAMING_OFFSET..]).is_err());
    }
}
