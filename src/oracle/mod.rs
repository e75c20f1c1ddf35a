pub mod conversion;

pub use conversion::{display_amount, ConversionOracle, ConversionRate};
