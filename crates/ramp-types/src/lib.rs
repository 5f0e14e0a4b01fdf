pub mod errors;
pub mod experiment;
pub mod parameter;
pub mod report;

pub use errors::*;
pub use experiment::*;
pub use parameter::*;
pub use report::*;
