pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{StubEngine, StubResponse};

#[cfg(feature = "backend-tract")]
pub use tract::TractEngine;
