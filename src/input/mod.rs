pub mod csv_reader;
pub mod models;

pub use csv_reader::read_distribution_file;
pub use models::*;
