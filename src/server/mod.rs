//! Server side: credit accounting, the once-per-RTT pool update, and the
//! interceptor that stamps grants onto responses.

mod aqm;
mod controller;
mod layer;
mod service;

pub(crate) use aqm::DelayCell;
pub use controller::{Connection, Controller};
pub use layer::AdmissionLayer;
pub use service::Admission;
