use thiserror::Error;

pub type Result<T> = std::result::Result<T, QtcError>;

#[derive(Error, Debug)]
pub enum QtcError {
    #[error("Structural error: {0}")]
    Structural(String),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Blockchain error: {0}")]
    Blockchain(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Transaction {0} is already in the pool")]
    DuplicateTransaction(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Stateful validation failures. A block or transaction rejected with one of
/// these is rejected in its position; nothing was committed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Double spend of output {0}")]
    DoubleSpend(String),

    #[error("Missing input: output {0} does not exist")]
    MissingInput(String),

    #[error("Immature coinbase output {output} spent at height {spend_height}, mature at {mature_height}")]
    Immature {
        output: String,
        spend_height: u64,
        mature_height: u64,
    },

    #[error("Proof of work does not satisfy bits {0:#010x}")]
    ProofOfWorkInvalid(u32),

    #[error("Block parent {got} does not extend the best block {expected}")]
    NonContiguous { expected: String, got: String },

    #[error("Invalid difficulty bits: expected {expected:#010x}, got {got:#010x}")]
    BadBits { expected: u32, got: u32 },

    #[error("Invalid block timestamp: {0}")]
    BadTimestamp(String),

    #[error("Coinbase pays {paid}, allowed {allowed}")]
    BadCoinbaseValue { paid: u64, allowed: u64 },

    #[error("Unbalanced asset {asset}: inputs {inputs}, outputs {outputs}")]
    Unbalanced {
        asset: String,
        inputs: u64,
        outputs: u64,
    },
}

impl QtcError {
    pub fn is_double_spend(&self) -> bool {
        matches!(self, QtcError::Consensus(ConsensusError::DoubleSpend(_)))
    }
}

impl<T> From<std::sync::PoisonError<T>> for QtcError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        QtcError::LockPoisoned
    }
}
