use crate::amount::Amount;
use crate::block;
use crate::keys::Address;
use crate::serialization::DenaroSerialize;
use crate::transaction::{Hash, TransactionOutput};

/// The synthetic transaction minting a block's reward plus fees to the
/// miner. Its single input is (block_hash, 0) and the signature list is
/// replaced by the sentinel byte 36.
#[derive(Clone, Debug)]
pub struct CoinbaseTransaction {
    pub block_hash: block::Hash,
    pub address: Address,
    pub amount: Amount,
    /// 1 when the miner address is serialized in full, 3 when compressed.
    pub version: u8,
}

impl CoinbaseTransaction {
    /// Builds the coinbase for a block, picking the transaction version that
    /// matches the miner address encoding in the block header.
    pub fn new(block_hash: block::Hash, address: Address, amount: Amount, compressed: bool) -> Self {
        CoinbaseTransaction {
            block_hash,
            address,
            amount,
            version: if compressed { 3 } else { 1 },
        }
    }

    pub fn output(&self) -> TransactionOutput {
        TransactionOutput::new(self.address, self.amount)
    }

    pub fn hex(&self) -> String {
        hex::encode(
            self.denaro_serialize_to_vec()
                .expect("writing to a Vec cannot fail"),
        )
    }

    pub fn hash(&self) -> Hash {
        Hash::of_bytes(
            &self
                .denaro_serialize_to_vec()
                .expect("writing to a Vec cannot fail"),
        )
    }

    /// A coinbase mints a positive amount to a valid point; no signatures to
    /// check.
    pub fn verify(&self) -> bool {
        self.output().verify()
    }
}

impl PartialEq for CoinbaseTransaction {
    fn eq(&self, other: &Self) -> bool {
        self.hex() == other.hex()
    }
}

impl Eq for CoinbaseTransaction {}
