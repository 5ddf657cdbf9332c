//! The inspection front end: the per-transaction state machine plus the
//! two protocol adapters that feed it (Envoy ext_proc and ICAP).

pub mod ext_proc;
pub mod icap;
pub mod session;

pub use ext_proc::ExtProcService;
pub use icap::IcapServer;
pub use session::{ProducerContext, RequestMeta, ScanSession, SessionOutcome};
