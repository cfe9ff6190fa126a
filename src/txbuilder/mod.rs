//! Transaction assembly for the external signer.
//!
//! A [`Builder`] collects inputs (each with the instruction a signer needs to
//! satisfy it) and outputs, and produces a [`Template`]. Signing fills input
//! arguments only, so the transaction id is fixed once the template is built.
//! [`finalize_tx`] is the last step before broadcast.

use crate::config::ConsensusParams;
use crate::core::transaction::{compute_output_id, AssetId, OutputId, TxId};
use crate::core::{Chain, Transaction, TxInput, TxOutput};
use crate::crypto::hash::Hash256;
use crate::error::ConsensusError;
use crate::{QtcError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// An account-level view of one spendable output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub output_id: OutputId,
    pub source_id: Hash256,
    pub source_pos: u64,
    pub asset_id: AssetId,
    pub amount: u64,
    pub control_program: Vec<u8>,
    pub control_program_index: u64,
    pub account_id: String,
    pub address: String,
    pub valid_height: u64,
}

impl Utxo {
    /// A record for an output the caller owns; the output id is derived
    /// from the source fields.
    pub fn new(source_id: Hash256, source_pos: u64, asset_id: AssetId, amount: u64, control_program: Vec<u8>) -> Self {
        Self {
            output_id: compute_output_id(&source_id, source_pos, &asset_id, amount, &control_program),
            source_id,
            source_pos,
            asset_id,
            amount,
            control_program,
            control_program_index: 0,
            account_id: String::new(),
            address: String::new(),
            valid_height: 0,
        }
    }

    /// Records every output of `tx`, e.g. change the caller wants to respend.
    pub fn from_transaction(tx: &Transaction) -> Vec<Self> {
        let tx_id = tx.id();
        tx.outputs
            .iter()
            .enumerate()
            .map(|(pos, output)| Self::new(tx_id, pos as u64, output.asset_id, output.amount, output.control_program.clone()))
            .collect()
    }
}

/// What the external signer needs to produce the arguments of one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningInstruction {
    pub position: usize,
    pub control_program: Vec<u8>,
    pub key_index: u64,
    pub account_id: String,
}

/// Spend input for `utxo` plus its signing instruction.
pub fn utxo_to_input(utxo: &Utxo) -> (TxInput, SigningInstruction) {
    let input = TxInput::new_spend(
        utxo.source_id,
        utxo.source_pos,
        utxo.asset_id,
        utxo.amount,
        utxo.control_program.clone(),
    );

    let instruction = SigningInstruction {
        position: 0,
        control_program: utxo.control_program.clone(),
        key_index: utxo.control_program_index,
        account_id: utxo.account_id.clone(),
    };

    (input, instruction)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub transaction: Transaction,
    pub signing_instructions: Vec<SigningInstruction>,
    /// Native asset left for the block producer.
    pub fee: u64,
}

impl Template {
    pub fn tx_id(&self) -> TxId {
        self.transaction.id()
    }

    /// Fills each instructed input's arguments with what `signer` returns.
    pub fn sign<F>(&mut self, mut signer: F) -> Result<()>
    where
        F: FnMut(&SigningInstruction, &TxId) -> Result<Vec<Vec<u8>>>,
    {
        let tx_id = self.tx_id();
        for instruction in &self.signing_instructions {
            let arguments = signer(instruction, &tx_id)?;
            let input = self
                .transaction
                .inputs
                .get_mut(instruction.position)
                .and_then(TxInput::arguments_mut)
                .ok_or_else(|| {
                    QtcError::Transaction(format!("No signable input at position {}", instruction.position))
                })?;
            *input = arguments;
        }
        Ok(())
    }
}

pub struct Builder {
    max_time: DateTime<Utc>,
    inputs: Vec<TxInput>,
    signing_instructions: Vec<SigningInstruction>,
    outputs: Vec<TxOutput>,
    native_asset: AssetId,
}

impl Builder {
    /// `max_time` bounds both when `build` may run and the transaction's
    /// time range. Fees are reported in the default network's native asset
    /// until [`Builder::with_native_asset`] says otherwise.
    pub fn new(max_time: DateTime<Utc>) -> Self {
        Self {
            max_time,
            inputs: Vec::new(),
            signing_instructions: Vec::new(),
            outputs: Vec::new(),
            native_asset: ConsensusParams::default().native_asset,
        }
    }

    /// Asset whose surplus is reported as the fee.
    pub fn with_native_asset(mut self, native_asset: AssetId) -> Self {
        self.native_asset = native_asset;
        self
    }

    pub fn add_input(&mut self, input: TxInput, mut instruction: SigningInstruction) -> &mut Self {
        instruction.position = self.inputs.len();
        self.inputs.push(input);
        self.signing_instructions.push(instruction);
        self
    }

    pub fn add_output(&mut self, output: TxOutput) -> &mut Self {
        self.outputs.push(output);
        self
    }

    pub fn restrict_max_time(&mut self, max_time: DateTime<Utc>) -> &mut Self {
        if max_time < self.max_time {
            self.max_time = max_time;
        }
        self
    }

    pub fn build(&self) -> Result<Template> {
        if Utc::now() > self.max_time {
            return Err(QtcError::Transaction(format!("Build window closed at {}", self.max_time)));
        }

        if self.inputs.is_empty() {
            return Err(QtcError::Transaction("Transaction has no inputs".to_string()));
        }

        if self.outputs.is_empty() {
            return Err(QtcError::Transaction("Transaction has no outputs".to_string()));
        }

        let mut seen = HashSet::new();
        for id in self.inputs.iter().filter_map(TxInput::spent_output_id) {
            if !seen.insert(id) {
                return Err(ConsensusError::DoubleSpend(id.to_hex()).into());
            }
        }

        let mut transaction = Transaction::new();
        transaction.time_range = self.max_time.timestamp_millis().max(0) as u64;
        transaction.inputs = self.inputs.clone();
        transaction.outputs = self.outputs.clone();

        let (inputs, outputs) = transaction
            .asset_totals()
            .ok_or_else(|| QtcError::Transaction("Amounts overflow".to_string()))?;
        check_balanced(&inputs, &outputs)?;

        let fee = transaction.fee(&self.native_asset);
        log::debug!(
            "Built transaction {} with {} inputs, {} outputs, fee {}",
            transaction.id(),
            transaction.inputs.len(),
            transaction.outputs.len(),
            fee
        );

        Ok(Template {
            transaction,
            signing_instructions: self.signing_instructions.clone(),
            fee,
        })
    }
}

fn check_balanced(inputs: &BTreeMap<AssetId, u64>, outputs: &BTreeMap<AssetId, u64>) -> Result<()> {
    for (asset, out) in outputs {
        let available = inputs.get(asset).copied().unwrap_or(0);
        if available < *out {
            return Err(ConsensusError::Unbalanced {
                asset: asset.to_string(),
                inputs: available,
                outputs: *out,
            }
            .into());
        }
    }
    Ok(())
}

/// Checks that `tx` is complete against the chain, then submits it to the
/// chain's pool.
pub fn finalize_tx(chain: &Chain, tx: Transaction) -> Result<()> {
    chain.finalize_for_signing(&tx)?;
    chain.validate_tx(tx)
}
