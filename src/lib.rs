pub mod activity;
pub mod consent;
pub mod core;
pub mod ledger;
pub mod logging;
pub mod persistence;
pub mod settings;
pub mod training;

pub use activity::{
    ActivityEvent,
    ActivityLog,
    ActivityOutcome,
    ActivitySink,
};
pub use consent::{
    spawn_countdown,
    ConsentController,
    ConsentPhase,
    ConsentPolicy,
    ConsentSnapshot,
};
pub use crate::core::{
    ConsentError,
    ConsoleError,
    ErrorKind,
    HospitalId,
    PatientId,
    SchedulerError,
};
pub use ledger::{
    FakeLedgerClient,
    HttpLedgerClient,
    LedgerError,
    RemoteLedgerClient,
};
pub use settings::ConsoleSettings;
pub use training::{
    AutoTrainConfig,
    RoundScheduler,
    SchedulerState,
};
