pub mod channel;
pub mod protocol;

pub use channel::{link, InitParams, WorkerChannel, WorkerEnd, WorkerLink};
pub use protocol::{CryptoErrorKind, WorkerRequest, WorkerResponse};
