// Pro-rata split of a lump share-token amount across recipients
pub mod engine;

pub use engine::{allocate, proportional_share, Allocation};
