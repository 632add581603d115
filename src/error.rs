use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
    #[error("Overcollection: amount due is {due}, received {received}")]
    Overcollection { due: Decimal, received: Decimal },
    #[error("Minimum payment is {due}, received {received}; partial payments are not allowed")]
    Underpayment { due: Decimal, received: Decimal },
    #[error("No outstanding dues; use an advance payment for credit deposits")]
    NoOutstandingDues,
    #[error("Insufficient credit: balance {balance}, requested {requested}")]
    InsufficientCredit { balance: Decimal, requested: Decimal },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("Cannot {action} while {status}")]
    InvalidTransition {
        action: &'static str,
        status: String,
    },
    #[error("Asset {asset} is already reserved for the requested slot")]
    SlotUnavailable { asset: u32 },
    #[error("Discount {id} is outside its validity window")]
    DiscountOutsideWindow { id: u32 },
    #[error("Discount {id} requires at least {required} months, got {months}")]
    DiscountNotEligible { id: u32, required: u32, months: u32 },
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDBError(#[from] rocksdb::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
