pub mod contracts;
pub mod gateway;
pub mod scval;
pub mod soroban;

pub use contracts::ContractClient;
pub use gateway::{ContractCall, TxOutcome};
pub use soroban::{SorobanConfig, SorobanRpcGateway};
