/// Error type for malformed or unrepresentable packets.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// The buffer is too short for the layer being parsed.
    #[error("invalid length: {0}")]
    InvalidLength(usize),

    /// The ACN UDP preamble did not match.
    #[error("invalid ACN UDP preamble")]
    InvalidPreamble,

    /// Unknown root layer vector.
    #[error("invalid root layer vector: {0:#010x}")]
    InvalidRootLayerVector(u32),

    /// Unknown framing layer vector.
    #[error("invalid framing layer vector: {0:#010x}")]
    InvalidFramingLayerVector(u32),

    /// The DMP layer's vector or fixed fields did not match.
    #[error("invalid DMP layer")]
    InvalidDmpLayer,

    /// Unknown universe discovery layer vector.
    #[error("invalid universe discovery layer vector: {0:#010x}")]
    InvalidUniverseDiscoveryLayerVector(u32),

    /// The source name is too long to pack (must be under 64 bytes).
    #[error("invalid source name length: {0}. Must be under 64 bytes.")]
    InvalidSourceNameLength(usize),

    /// The declared slot count extends past the end of the datagram.
    #[error("slot count out of range: {0}")]
    SlotCountOutOfRange(u16),
}
