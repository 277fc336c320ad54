pub mod history;
pub mod scheduler;


pub use history::TrainingHistoryStore;
pub use scheduler::{
    AutoTrainConfig,
    AutoTrainHandle,
    AutoTrainProgress,
    AutoTrainStop,
    AutoTrainSummary,
    RoundScheduler,
    SchedulerSnapshot,
    SchedulerState,
};
