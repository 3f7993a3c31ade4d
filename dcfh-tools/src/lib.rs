//! Generic helpers shared by the dcfh crates.

pub mod fs;
pub mod nom;
pub mod shutdown;
pub mod units;

pub use shutdown::ShutdownSignal;
