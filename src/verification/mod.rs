// src/verification/mod.rs

pub mod description;
pub mod engine;
pub mod policy;
pub mod remote;
pub mod tasks;
pub mod text_confirmation;

pub use description::NormalizedDescription;
pub use engine::{
    apply_outcome, AttemptVerdict, TextConfirmation, VerificationEngine, VerificationEvent,
    VerifierBackends,
};
pub use policy::EscalationPolicy;
pub use remote::RemoteVerifierClient;
pub use tasks::InFlightTasks;
pub use text_confirmation::{TextThresholds, TextVerdict};
