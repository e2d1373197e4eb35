use proptest::prelude::*;

use p256::ecdsa::SigningKey;

use crate::amount::Amount;
use crate::keys::{address_for_key, Address};
use crate::transaction::{
    CoinbaseTransaction, Hash, RegularTransaction, Transaction, TransactionError,
    TransactionInput, TransactionOutput,
};

fn test_key(seed: u8) -> SigningKey {
    let mut bytes = [0u8; 32];
    bytes[31] = seed;
    SigningKey::from_slice(&bytes).expect("small scalars are valid keys")
}

fn test_address(seed: u8) -> Address {
    address_for_key(&test_key(seed))
}

fn funded_input(seed: u8, index: u8, owner: u8, coins: u64) -> TransactionInput {
    let mut input = TransactionInput::new(Hash::of_bytes(&[seed]), index);
    input.related_output = Some(TransactionOutput::new(
        test_address(owner),
        Amount::from_coins(coins),
    ));
    input
}

fn transfer(version: u8, inputs: Vec<TransactionInput>, outputs: Vec<TransactionOutput>) -> RegularTransaction {
    RegularTransaction {
        version,
        inputs,
        outputs,
        message: None,
        undistributed_signatures: Vec::new(),
    }
}

#[test]
fn round_trip_preserves_bytes_and_hash() {
    let mut tx = transfer(
        1,
        vec![funded_input(1, 0, 7, 10)],
        vec![TransactionOutput::new(test_address(8), Amount::from_coins(9))],
    );
    tx.sign(&test_key(7));

    let hex_form = tx.hex();
    let parsed = Transaction::from_hex(&hex_form).unwrap();
    assert_eq!(parsed.hex(), hex_form);
    assert_eq!(
        parsed.hash(),
        Hash::of_bytes(&hex::decode(&hex_form).unwrap())
    );
    assert_eq!(parsed, Transaction::Regular(tx));
}

#[test]
fn shared_signature_is_stored_once() {
    let mut tx = transfer(
        1,
        vec![funded_input(1, 0, 7, 5), funded_input(2, 1, 7, 5)],
        vec![TransactionOutput::new(test_address(8), Amount::from_coins(10))],
    );
    tx.sign(&test_key(7));
    assert_eq!(tx.inputs[0].signature, tx.inputs[1].signature);

    // body + specifier + one (r, s) pair
    let body_len = tx.unsigned_hex().len();
    assert_eq!(tx.hex().len(), body_len + 2 + 128);

    let parsed = Transaction::from_hex(&tx.hex()).unwrap();
    let parsed = match parsed {
        Transaction::Regular(tx) => tx,
        Transaction::Coinbase(_) => panic!("parsed a transfer as coinbase"),
    };
    assert_eq!(parsed.inputs[0].signature, tx.inputs[0].signature);
    assert_eq!(parsed.inputs[1].signature, tx.inputs[1].signature);
}

#[test]
fn grouped_signatures_distribute_by_public_key() {
    let mut tx = transfer(
        1,
        vec![
            funded_input(1, 0, 7, 5),
            funded_input(2, 1, 7, 5),
            funded_input(3, 0, 9, 5),
        ],
        vec![TransactionOutput::new(test_address(8), Amount::from_coins(14))],
    );
    tx.sign(&test_key(7));
    tx.sign(&test_key(9));
    tx.verify().expect("fully signed transaction verifies");

    let parsed = Transaction::from_hex(&tx.hex()).unwrap();
    let mut parsed = match parsed {
        Transaction::Regular(tx) => tx,
        Transaction::Coinbase(_) => panic!("parsed a transfer as coinbase"),
    };
    // two deduplicated signatures for three inputs: held until distribution
    assert_eq!(parsed.undistributed_signatures.len(), 2);
    for (parsed_input, original) in parsed.inputs.iter_mut().zip(&tx.inputs) {
        parsed_input.related_output = original.related_output.clone();
    }
    parsed.distribute_signatures().unwrap();
    assert_eq!(parsed.verify(), Ok(Amount::from_coins(1)));
}

#[test]
fn compressed_v3_transaction_round_trips_and_pays_fees() {
    let mut tx = transfer(
        3,
        vec![funded_input(1, 0, 7, 5)],
        vec![TransactionOutput::new(
            test_address(8),
            "4.5".parse().unwrap(),
        )],
    );
    tx.message = Some(b"ciao".to_vec());
    tx.sign(&test_key(7));

    let hex_form = tx.hex();
    let parsed = Transaction::from_hex(&hex_form).unwrap();
    assert_eq!(parsed.hex(), hex_form);

    let fee = tx.verify().unwrap();
    assert_eq!(fee, "0.5".parse().unwrap());
    assert_eq!(fee.smallest(), 500_000);
}

#[test]
fn long_messages_need_version_3() {
    let mut tx = transfer(
        3,
        vec![funded_input(1, 0, 7, 5)],
        vec![TransactionOutput::new(test_address(8), Amount::from_coins(1))],
    );
    tx.message = Some(vec![0x61; 300]);
    tx.sign(&test_key(7));
    let parsed = Transaction::from_hex(&tx.hex()).unwrap();
    assert_eq!(parsed, Transaction::Regular(tx.clone()));

    tx.version = 1;
    assert!(tx.denaro_serialize_to_vec().is_err());
}

#[test]
fn coinbase_round_trips() {
    let coinbase = CoinbaseTransaction::new(
        crate::block::genesis_previous_hash(),
        test_address(4),
        Amount::from_coins(100),
        false,
    );
    let parsed = Transaction::from_hex(&coinbase.hex()).unwrap();
    assert!(parsed.is_coinbase());
    assert_eq!(parsed, Transaction::Coinbase(coinbase.clone()));

    let compressed = CoinbaseTransaction::new(
        crate::block::genesis_previous_hash(),
        test_address(4),
        Amount::from_coins(100),
        true,
    );
    assert!(compressed.hex().len() < coinbase.hex().len());
    assert_eq!(
        Transaction::from_hex(&compressed.hex()).unwrap(),
        Transaction::Coinbase(compressed)
    );
}

#[test]
fn duplicate_inputs_are_rejected() {
    let mut tx = transfer(
        1,
        vec![funded_input(1, 0, 7, 5), funded_input(1, 0, 7, 5)],
        vec![TransactionOutput::new(test_address(8), Amount::from_coins(9))],
    );
    tx.sign(&test_key(7));
    assert_eq!(tx.verify(), Err(TransactionError::DuplicateInput));
}

#[test]
fn outputs_exceeding_inputs_are_rejected() {
    let mut tx = transfer(
        1,
        vec![funded_input(1, 0, 7, 5)],
        vec![TransactionOutput::new(test_address(8), Amount::from_coins(6))],
    );
    tx.sign(&test_key(7));
    assert_eq!(tx.verify(), Err(TransactionError::InsufficientInputs));
}

#[test]
fn zero_outputs_are_rejected() {
    let mut tx = transfer(
        1,
        vec![funded_input(1, 0, 7, 5)],
        vec![TransactionOutput::new(test_address(8), Amount::ZERO)],
    );
    tx.sign(&test_key(7));
    assert_eq!(tx.verify(), Err(TransactionError::ZeroAmountOutput));
}

#[test]
fn tampering_breaks_the_signature() {
    let mut tx = transfer(
        1,
        vec![funded_input(1, 0, 7, 5)],
        vec![TransactionOutput::new(test_address(8), Amount::from_coins(4))],
    );
    tx.sign(&test_key(7));
    tx.outputs[0].amount = Amount::from_coins(1);
    assert_eq!(tx.verify(), Err(TransactionError::BadSignature));
}

use crate::serialization::DenaroSerialize;

proptest! {
    #[test]
    fn arbitrary_messages_round_trip(message in proptest::collection::vec(any::<u8>(), 0..512)) {
        let mut tx = transfer(
            3,
            vec![funded_input(1, 0, 7, 5)],
            vec![TransactionOutput::new(test_address(8), Amount::from_coins(1))],
        );
        tx.message = Some(message);
        tx.sign(&test_key(7));
        let parsed = Transaction::from_hex(&tx.hex()).unwrap();
        prop_assert_eq!(parsed, Transaction::Regular(tx));
    }

    #[test]
    fn arbitrary_amounts_round_trip(units in any::<u64>()) {
        let amount = Amount::from_smallest(units);
        let bytes = amount.denaro_serialize_to_vec().unwrap();
        let parsed = crate::serialization::DenaroDeserialize::denaro_deserialize(&bytes[..]).unwrap();
        prop_assert_eq!(amount, parsed);
    }
}
