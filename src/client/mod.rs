//! Client side: the bounded admission queue, the credit gate, and the
//! interceptor that piggybacks demand onto outbound requests.

mod admitter;
mod layer;
mod service;

pub use admitter::{AdmitError, Admitter};
pub use layer::CreditGateLayer;
pub use service::CreditGate;
