mod randomness;
mod types;

pub use randomness::*;
pub use types::*;
