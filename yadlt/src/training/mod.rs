//! Training machinery shared by the models.
mod loss;
pub use loss::Loss;

pub mod metrics;
pub use metrics::{accuracy, MetricsError, TrainingHistory};

pub mod optimizer;
pub use optimizer::{Optimizer, OptimizerKind};

mod schedule;
pub use schedule::{Schedule, ScheduleError};
