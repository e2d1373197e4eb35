//! The transaction wire codec.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! version:1 | n_inputs:1 | (tx_hash:32, index:1)*  | n_outputs:1
//!          | (address:64|33, amount_len:1, amount:amount_len)*
//!          | specifier:1
//! ```
//!
//! Specifier 36 ends a coinbase. Specifier 1 is followed by a message
//! (1-byte length up to version 2, 2-byte for version 3). The signature
//! list of (r:32, s:32) pairs comes last, deduplicated, ending at an r = 0
//! sentinel or end of stream; the encoder writes no trailing sentinel.

use std::io::{self, Cursor, Read, Write};

use crate::keys::{Address, InputSignature};
use crate::serialization::{DenaroDeserialize, DenaroSerialize, SerializationError};
use crate::transaction::{
    CoinbaseTransaction, Hash, RegularTransaction, Transaction, TransactionInput,
    TransactionOutput,
};
use crate::{amount::Amount, block};

/// Marks the end of a coinbase transaction in place of signatures.
pub const COINBASE_SPECIFIER: u8 = 36;
const MESSAGE_SPECIFIER: u8 = 1;
const NO_MESSAGE_SPECIFIER: u8 = 0;

fn serialize_output<W: Write>(
    output: &TransactionOutput,
    version: u8,
    mut target: W,
) -> Result<(), io::Error> {
    if version == 3 {
        target.write_all(&output.address.to_compressed_bytes())?;
    } else {
        target.write_all(&output.address.to_full_bytes())?;
    }
    output.amount.denaro_serialize(&mut target)
}

/// The unsigned prefix: everything signatures are computed over.
pub(super) fn serialize_body(tx: &RegularTransaction) -> Result<Vec<u8>, io::Error> {
    if tx.inputs.len() > 255 || tx.outputs.len() > 255 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "too many inputs or outputs",
        ));
    }
    let mut target = Vec::new();
    tx.version.denaro_serialize(&mut target)?;
    (tx.inputs.len() as u8).denaro_serialize(&mut target)?;
    for input in &tx.inputs {
        input.tx_hash.0.denaro_serialize(&mut target)?;
        input.index.denaro_serialize(&mut target)?;
    }
    (tx.outputs.len() as u8).denaro_serialize(&mut target)?;
    for output in &tx.outputs {
        serialize_output(output, tx.version, &mut target)?;
    }
    if let Some(message) = &tx.message {
        MESSAGE_SPECIFIER.denaro_serialize(&mut target)?;
        if tx.version == 3 {
            if message.len() > super::MAX_MESSAGE_LENGTH_V3 {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "message too long"));
            }
            (message.len() as u16).denaro_serialize(&mut target)?;
        } else {
            if message.len() > super::MAX_MESSAGE_LENGTH_V1 {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "message too long"));
            }
            (message.len() as u8).denaro_serialize(&mut target)?;
        }
        target.write_all(message)?;
    }
    Ok(target)
}

impl DenaroSerialize for RegularTransaction {
    fn denaro_serialize<W: Write>(&self, mut target: W) -> Result<(), io::Error> {
        target.write_all(&serialize_body(self)?)?;
        if self.message.is_none() {
            NO_MESSAGE_SPECIFIER.denaro_serialize(&mut target)?;
        }

        // Identical (r, s) pairs shared by several inputs are stored once,
        // in first-seen order.
        let mut written: Vec<InputSignature> = Vec::new();
        let assigned = self.inputs.iter().filter_map(|input| input.signature);
        for signature in assigned.chain(self.undistributed_signatures.iter().copied()) {
            if written.contains(&signature) {
                continue;
            }
            target.write_all(&signature.r)?;
            target.write_all(&signature.s)?;
            written.push(signature);
        }
        Ok(())
    }
}

impl DenaroSerialize for CoinbaseTransaction {
    fn denaro_serialize<W: Write>(&self, mut target: W) -> Result<(), io::Error> {
        self.version.denaro_serialize(&mut target)?;
        1u8.denaro_serialize(&mut target)?;
        self.block_hash.0.denaro_serialize(&mut target)?;
        0u8.denaro_serialize(&mut target)?;
        1u8.denaro_serialize(&mut target)?;
        serialize_output(&self.output(), self.version, &mut target)?;
        COINBASE_SPECIFIER.denaro_serialize(&mut target)
    }
}

impl DenaroSerialize for Transaction {
    fn denaro_serialize<W: Write>(&self, target: W) -> Result<(), io::Error> {
        match self {
            Transaction::Regular(tx) => tx.denaro_serialize(target),
            Transaction::Coinbase(tx) => tx.denaro_serialize(target),
        }
    }
}

/// Reads one 32-byte signature scalar; `None` at end of stream, which the
/// original network treats the same as the zero sentinel.
fn read_scalar<R: Read>(mut reader: R) -> Result<Option<[u8; 32]>, SerializationError> {
    let mut buf = [0u8; 32];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(Some(buf)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(super) fn transaction_from_hex(hex_string: &str) -> Result<Transaction, SerializationError> {
    let bytes = hex::decode(hex_string).map_err(|_| SerializationError::Parse("invalid hex"))?;
    Transaction::denaro_deserialize(Cursor::new(bytes))
}

impl DenaroDeserialize for Transaction {
    fn denaro_deserialize<R: Read>(mut reader: R) -> Result<Self, SerializationError> {
        let version = u8::denaro_deserialize(&mut reader)?;
        if !(1..=3).contains(&version) {
            return Err(SerializationError::Parse("unsupported transaction version"));
        }

        let n_inputs = u8::denaro_deserialize(&mut reader)?;
        let mut inputs = Vec::with_capacity(n_inputs as usize);
        for _ in 0..n_inputs {
            let tx_hash = Hash(<[u8; 32]>::denaro_deserialize(&mut reader)?);
            let index = u8::denaro_deserialize(&mut reader)?;
            inputs.push(TransactionInput::new(tx_hash, index));
        }

        let n_outputs = u8::denaro_deserialize(&mut reader)?;
        let mut outputs = Vec::with_capacity(n_outputs as usize);
        for _ in 0..n_outputs {
            let address = if version == 3 {
                let mut bytes = [0u8; 33];
                reader.read_exact(&mut bytes)?;
                Address::from_compressed_bytes(&bytes)?
            } else {
                let mut bytes = [0u8; 64];
                reader.read_exact(&mut bytes)?;
                Address::from_full_bytes(&bytes)?
            };
            let amount = Amount::denaro_deserialize(&mut reader)?;
            outputs.push(TransactionOutput::new(address, amount));
        }

        let specifier = u8::denaro_deserialize(&mut reader)?;
        let message = match specifier {
            COINBASE_SPECIFIER => {
                if inputs.len() != 1 || outputs.len() != 1 {
                    return Err(SerializationError::Parse(
                        "coinbase must have one input and one output",
                    ));
                }
                let input = &inputs[0];
                let output = &outputs[0];
                return Ok(Transaction::Coinbase(CoinbaseTransaction {
                    block_hash: block::Hash(input.tx_hash.0),
                    address: output.address,
                    amount: output.amount,
                    version,
                }));
            }
            NO_MESSAGE_SPECIFIER => None,
            MESSAGE_SPECIFIER => {
                let len = if version == 3 {
                    u16::denaro_deserialize(&mut reader)? as usize
                } else {
                    u8::denaro_deserialize(&mut reader)? as usize
                };
                let mut message = vec![0u8; len];
                reader.read_exact(&mut message)?;
                Some(message)
            }
            _ => return Err(SerializationError::Parse("invalid specifier")),
        };

        let mut signatures = Vec::new();
        while let Some(r) = read_scalar(&mut reader)? {
            if r == [0u8; 32] {
                break;
            }
            let s = read_scalar(&mut reader)?
                .ok_or(SerializationError::Parse("truncated signature"))?;
            signatures.push(InputSignature { r, s });
        }

        let mut tx = RegularTransaction {
            version,
            inputs,
            outputs,
            message,
            undistributed_signatures: Vec::new(),
        };

        // Distribution rules, in order: a lone signature is shared by every
        // input; a signature per input maps positionally; anything else is
        // grouped by public key once the referenced outputs are known.
        if signatures.len() == 1 {
            for input in &mut tx.inputs {
                input.signature = Some(signatures[0]);
            }
        } else if signatures.len() == tx.inputs.len() {
            for (input, signature) in tx.inputs.iter_mut().zip(signatures) {
                input.signature = Some(signature);
            }
        } else {
            tx.undistributed_signatures = signatures;
        }

        Ok(Transaction::Regular(tx))
    }
}
