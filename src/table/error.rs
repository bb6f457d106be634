use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("object id required")]
    ObjectIdRequired,

    #[error("object id too long: {0} bytes")]
    ObjectIdTooLong(usize),

    #[error("property not found: {0}")]
    PropertyNotFound(String),

    #[error("duplicate property: {0}")]
    DuplicateProperty(String),

    #[error("property is not a factor: {0}")]
    PropertyNotFactor(String),

    #[error("factor index not found: {0}")]
    FactorMissing(u64),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("table not open")]
    TableNotOpen,

    #[error("table busy: {0}")]
    TableBusy(String),

    #[error("storage engine error: {0}")]
    Storage(#[from] fjall::Error),

    #[error("{op} failed on table {table}: {source}")]
    Transaction {
        op: &'static str,
        table: String,
        #[source]
        source: fjall::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TableError {
    /// Attach transaction context to storage-level failures; logical errors
    /// (missing property, bad object id, ...) pass through untouched.
    pub(crate) fn in_op(self, op: &'static str, table: &str) -> TableError {
        match self {
            TableError::Storage(source) => TableError::Transaction {
                op,
                table: table.to_string(),
                source,
            },
            other => other,
        }
    }
}

impl From<serde_json::Error> for TableError {
    fn from(err: serde_json::Error) -> Self {
        TableError::Encoding(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for TableError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        TableError::Encoding(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TableError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        TableError::Encoding(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TableError>;
