pub mod scripted;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use scripted::ScriptedEstimator;
pub use stub::StubEstimator;

#[cfg(feature = "backend-tract")]
pub use tract::MoveNetBackend;
