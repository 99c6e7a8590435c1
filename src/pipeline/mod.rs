// src/pipeline/mod.rs

pub mod coordinator;
pub mod event_bus;
pub mod frame_context;
pub mod metrics;
pub mod phase;

pub use coordinator::{
    CandidateSummary, FrameReport, NavigationCue, PipelineCoordinator, PipelineCoordinatorBuilder,
};
pub use event_bus::{EventBus, PipelineEvent};
pub use frame_context::FrameContext;
pub use metrics::{MetricsSummary, PipelineMetrics};
pub use phase::{reduce_phase, Phase};
