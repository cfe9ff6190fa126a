use crate::crypto::hash::{Hash256, Hashable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifies one transaction output; the key into the UTXO set.
pub type OutputId = Hash256;

pub type TxId = Hash256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(Hash256);

impl AssetId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(Hash256::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl From<Hash256> for AssetId {
    fn from(hash: Hash256) -> Self {
        Self(hash)
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Output ids commit to where the output came from and what it holds, so a
/// spend that lies about the amount or program names an output that does not exist.
pub fn compute_output_id(
    source_id: &Hash256,
    source_pos: u64,
    asset_id: &AssetId,
    amount: u64,
    control_program: &[u8],
) -> OutputId {
    Hash256::hash_parts(&[
        b"output",
        source_id.as_bytes(),
        &source_pos.to_le_bytes(),
        asset_id.as_bytes(),
        &amount.to_le_bytes(),
        &(control_program.len() as u64).to_le_bytes(),
        control_program,
    ])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub asset_id: AssetId,
    pub amount: u64,
    pub control_program: Vec<u8>,
}

impl TxOutput {
    pub fn new(asset_id: AssetId, amount: u64, control_program: Vec<u8>) -> Self {
        Self {
            asset_id,
            amount,
            control_program,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendInput {
    pub source_id: Hash256,
    pub source_pos: u64,
    pub asset_id: AssetId,
    pub amount: u64,
    pub control_program: Vec<u8>,
    pub arguments: Vec<Vec<u8>>,
}

impl SpendInput {
    pub fn spent_output_id(&self) -> OutputId {
        compute_output_id(
            &self.source_id,
            self.source_pos,
            &self.asset_id,
            self.amount,
            &self.control_program,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceInput {
    pub nonce: Vec<u8>,
    pub asset_id: AssetId,
    pub amount: u64,
    pub arguments: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinbaseInput {
    pub arbitrary: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxInput {
    Spend(SpendInput),
    Issuance(IssuanceInput),
    Coinbase(CoinbaseInput),
}

impl TxInput {
    pub fn new_spend(
        source_id: Hash256,
        source_pos: u64,
        asset_id: AssetId,
        amount: u64,
        control_program: Vec<u8>,
    ) -> Self {
        TxInput::Spend(SpendInput {
            source_id,
            source_pos,
            asset_id,
            amount,
            control_program,
            arguments: Vec::new(),
        })
    }

    pub fn spent_output_id(&self) -> Option<OutputId> {
        match self {
            TxInput::Spend(spend) => Some(spend.spent_output_id()),
            _ => None,
        }
    }

    pub fn asset_amount(&self) -> Option<(AssetId, u64)> {
        match self {
            TxInput::Spend(spend) => Some((spend.asset_id, spend.amount)),
            TxInput::Issuance(issuance) => Some((issuance.asset_id, issuance.amount)),
            TxInput::Coinbase(_) => None,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self, TxInput::Coinbase(_))
    }

    pub fn arguments_mut(&mut self) -> Option<&mut Vec<Vec<u8>>> {
        match self {
            TxInput::Spend(spend) => Some(&mut spend.arguments),
            TxInput::Issuance(issuance) => Some(&mut issuance.arguments),
            TxInput::Coinbase(_) => None,
        }
    }

    // Witness arguments are left out so that signing does not change the tx id.
    fn write_id_bytes(&self, data: &mut Vec<u8>) {
        match self {
            TxInput::Spend(spend) => {
                data.push(0x01);
                data.extend_from_slice(spend.spent_output_id().as_bytes());
            }
            TxInput::Issuance(issuance) => {
                data.push(0x02);
                data.extend_from_slice(&(issuance.nonce.len() as u64).to_le_bytes());
                data.extend_from_slice(&issuance.nonce);
                data.extend_from_slice(issuance.asset_id.as_bytes());
                data.extend_from_slice(&issuance.amount.to_le_bytes());
            }
            TxInput::Coinbase(coinbase) => {
                data.push(0x00);
                data.extend_from_slice(&(coinbase.arbitrary.len() as u64).to_le_bytes());
                data.extend_from_slice(&coinbase.arbitrary);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u64,
    pub time_range: u64,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            version: 1,
            time_range: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn new_coinbase(arbitrary: Vec<u8>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: 1,
            time_range: 0,
            inputs: vec![TxInput::Coinbase(CoinbaseInput { arbitrary })],
            outputs,
        }
    }

    pub fn id(&self) -> TxId {
        self.hash()
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    pub fn spent_output_ids(&self) -> Vec<OutputId> {
        self.inputs.iter().filter_map(TxInput::spent_output_id).collect()
    }

    pub fn output_id(&self, index: usize) -> Option<OutputId> {
        let output = self.outputs.get(index)?;
        Some(compute_output_id(
            &self.id(),
            index as u64,
            &output.asset_id,
            output.amount,
            &output.control_program,
        ))
    }

    pub fn output_ids(&self) -> Vec<OutputId> {
        let tx_id = self.id();
        self.outputs
            .iter()
            .enumerate()
            .map(|(pos, output)| {
                compute_output_id(&tx_id, pos as u64, &output.asset_id, output.amount, &output.control_program)
            })
            .collect()
    }

    /// Per-asset totals of inputs and outputs. `None` on overflow.
    pub fn asset_totals(&self) -> Option<(BTreeMap<AssetId, u64>, BTreeMap<AssetId, u64>)> {
        let mut inputs: BTreeMap<AssetId, u64> = BTreeMap::new();
        for (asset, amount) in self.inputs.iter().filter_map(TxInput::asset_amount) {
            let total = inputs.entry(asset).or_insert(0);
            *total = total.checked_add(amount)?;
        }

        let mut outputs: BTreeMap<AssetId, u64> = BTreeMap::new();
        for output in &self.outputs {
            let total = outputs.entry(output.asset_id).or_insert(0);
            *total = total.checked_add(output.amount)?;
        }

        Some((inputs, outputs))
    }

    /// Native-asset fee: what the inputs carry beyond what the outputs pay out.
    pub fn fee(&self, native_asset: &AssetId) -> u64 {
        if self.is_coinbase() {
            return 0;
        }

        let input_value: u64 = self
            .inputs
            .iter()
            .filter_map(TxInput::asset_amount)
            .filter(|(asset, _)| asset == native_asset)
            .fold(0u64, |acc, (_, amount)| acc.saturating_add(amount));

        input_value.saturating_sub(self.output_value(native_asset))
    }

    pub fn output_value(&self, asset: &AssetId) -> u64 {
        self.outputs
            .iter()
            .filter(|output| &output.asset_id == asset)
            .fold(0u64, |acc, output| acc.saturating_add(output.amount))
    }

    pub fn size(&self) -> usize {
        bincode::serialized_size(self).map(|size| size as usize).unwrap_or(usize::MAX)
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Hashable for Transaction {
    fn hash(&self) -> Hash256 {
        let mut data = Vec::new();

        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(&self.time_range.to_le_bytes());

        data.extend_from_slice(&(self.inputs.len() as u64).to_le_bytes());
        for input in &self.inputs {
            input.write_id_bytes(&mut data);
        }

        data.extend_from_slice(&(self.outputs.len() as u64).to_le_bytes());
        for output in &self.outputs {
            data.extend_from_slice(output.asset_id.as_bytes());
            data.extend_from_slice(&output.amount.to_le_bytes());
            data.extend_from_slice(&(output.control_program.len() as u64).to_le_bytes());
            data.extend_from_slice(&output.control_program);
        }

        Hash256::hash(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native() -> AssetId {
        AssetId::new([0xff; 32])
    }

    #[test]
    fn test_coinbase_transaction() {
        let tx = Transaction::new_coinbase(
            b"genesis".to_vec(),
            vec![TxOutput::new(native(), 41_250_000_000, vec![0x51])],
        );

        assert!(tx.is_coinbase());
        assert!(tx.spent_output_ids().is_empty());
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.fee(&native()), 0);
    }

    #[test]
    fn test_arguments_do_not_change_id() {
        let mut tx = Transaction::new();
        tx.inputs.push(TxInput::new_spend(Hash256::hash(b"src"), 0, native(), 1000, vec![0x51]));
        tx.outputs.push(TxOutput::new(native(), 900, vec![0x51]));

        let unsigned = tx.id();
        if let Some(arguments) = tx.inputs[0].arguments_mut() {
            arguments.push(vec![0xde, 0xad]);
        }

        assert_eq!(unsigned, tx.id());
        assert_eq!(tx.fee(&native()), 100);
    }

    #[test]
    fn test_output_id_binds_amount() {
        let source = Hash256::hash(b"src");
        let honest = TxInput::new_spend(source, 3, native(), 1000, vec![0x51]);
        let inflated = TxInput::new_spend(source, 3, native(), 1001, vec![0x51]);

        assert_eq!(
            honest.spent_output_id(),
            Some(compute_output_id(&source, 3, &native(), 1000, &[0x51]))
        );
        assert_ne!(honest.spent_output_id(), inflated.spent_output_id());
    }

    #[test]
    fn test_output_ids_match_spends() {
        let mut tx = Transaction::new();
        tx.inputs.push(TxInput::new_spend(Hash256::hash(b"src"), 0, native(), 1000, vec![0x51]));
        tx.outputs.push(TxOutput::new(native(), 600, vec![0x51]));
        tx.outputs.push(TxOutput::new(native(), 300, vec![0x52]));

        let spend = TxInput::new_spend(tx.id(), 1, native(), 300, vec![0x52]);
        assert_eq!(tx.output_ids()[1], spend.spent_output_id().unwrap());
        assert_eq!(tx.output_id(1), spend.spent_output_id());
        assert_eq!(tx.output_id(2), None);
    }

    #[test]
    fn test_asset_totals_overflow() {
        let mut tx = Transaction::new();
        tx.inputs.push(TxInput::new_spend(Hash256::hash(b"a"), 0, native(), u64::MAX, vec![]));
        tx.inputs.push(TxInput::new_spend(Hash256::hash(b"b"), 0, native(), 1, vec![]));

        assert!(tx.asset_totals().is_none());
    }
}
