use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("store error: {0}")]
    Store(#[from] tokenkeep_core::StoreError),

    #[error("timed out waiting for [{0}]")]
    WaitTimeout(String),
}

pub type Result<T> = std::result::Result<T, BusError>;
