pub mod access;
pub mod directory;
pub mod dispatcher;
pub mod hold_ledger;
pub mod metrics;
pub mod request_machine;
pub mod store;
pub mod sweeper;
pub mod token_codec;
pub mod transports;

pub use access::{AccessService, ExtendedHold};
pub use directory::{Contact, Directory, Site, StaticDirectory};
pub use dispatcher::{BatchEntry, BatchReport, DispatchReport, NotificationDispatcher, Notified};
pub use hold_ledger::{ExtendOutcome, HoldLedger};
pub use metrics::{get_metrics, init_metrics};
pub use request_machine::{AccessRequestMachine, Decision, SubmitAccess};
pub use store::{AccessDb, MemoryStore};
pub use sweeper::{ExpirySweeper, SweepReport};
pub use token_codec::{TokenClaims, TokenCodec, TokenRejection, TokenValidation};
pub use transports::{FcmTransport, MockTransport, Msg91Transport, SmtpTransport, Transport};
