pub mod clock;
pub mod errors;
pub mod models;
pub mod tasks;

pub use clock::{ Clock, ManualClock, SystemClock };
pub use errors::{ ConsentError, ConsoleError, ErrorKind, SchedulerError };
pub use models::{
    ConsentStatus, CurrentMetrics, HospitalId, HospitalSummary, LedgerReceipt, OtpDelivery,
    PatientId, RoundMetrics, RoundOutcome, RoundRecord,
};
