use crate::amount::Amount;
use crate::keys::Address;

/// A transaction output: an amount locked to an address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransactionOutput {
    pub address: Address,
    pub amount: Amount,
}

impl TransactionOutput {
    pub fn new(address: Address, amount: Amount) -> TransactionOutput {
        TransactionOutput { address, amount }
    }

    /// A spendable output carries a positive amount. The address is a valid
    /// curve point by construction, so the curve-membership half of the rule
    /// is enforced at parse time.
    pub fn verify(&self) -> bool {
        !self.amount.is_zero()
    }
}
