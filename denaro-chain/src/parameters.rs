//! Consensus-critical chain parameters: legacy activation heights and the
//! one hard-coded checkpoint block.
//!
//! These branches are part of consensus and must never be generalized: a
//! node that evaluates them differently forks off the network.

/// Blocks up to this height derive hashrate from difficulty with the
/// original (slightly wrong) formula; the corrected formula applies after.
/// The reverse conversion switches at the same height, but exclusive.
pub const HASHRATE_FORMULA_HEIGHT: u32 = 17_500;

/// First height whose merkle root hashes transactions sorted by serialized
/// bytes instead of miner order.
pub const SORTED_MERKLE_HEIGHT: u32 = 22_500;

/// Heights above this verify the coinbase output (curve membership and a
/// positive amount) before committing.
pub const COINBASE_VERIFY_HEIGHT: u32 = 35_000;

/// A historical block that does not satisfy the ordinary consensus rules
/// and is accepted by exact field match instead.
pub mod checkpoint {
    /// Height of the checkpoint block.
    pub const HEIGHT: u32 = 17_972;

    /// The only miner address the checkpoint accepts.
    pub const ADDRESS: &str = "dbda85e237b90aa669da00f2859e0010b0a62e0fb6e55ba6ca3ce8a961a60c64410bcfb6a038310a3bb6f1a4aaa2de1192cc10e380a774bb6f9c6ca8547f11ab";

    /// The only header timestamp the checkpoint accepts.
    pub const TIMESTAMP: u32 = 1_638_463_765;

    /// The only nonce the checkpoint accepts.
    pub const NONCE: u32 = 17_660_081;

    /// The hash recorded for the checkpoint block regardless of its content
    /// hash.
    pub const FORCED_HASH: &str =
        "37cb1a0522c039330775e07d824c94e0422dbfb2dba6dcd421f4dc9f11601672";

    /// A merkle root that rescues the checkpoint block when the ordered
    /// root does not match.
    pub const FALLBACK_MERKLE_ROOT: &str =
        "cb52390983d1902bf7d0eb96ed3f8adc359d34b6617dcccd2b610349e0ee8d15";
}
