// Execution Engine Module
// Collaborator interface the admission pipeline executes through

pub mod drivers;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{EngineError, EngineResult};
pub use traits::QueryEngine;
pub use types::*;
