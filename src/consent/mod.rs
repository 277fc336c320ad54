//! Patient consent: OTP issuance, verification and ledger grant/revoke.

pub mod controller;
pub mod countdown;
pub mod session;

pub use controller::{
    ConsentController,
    ConsentPolicy,
};
pub use countdown::{
    spawn_countdown,
    CountdownHandle,
};
pub use session::{
    ConsentPhase,
    ConsentSession,
    ConsentSnapshot,
};
