use std::sync::Arc;

use tower::Layer;

use super::{Admitter, CreditGate};
use crate::config::AdmissionConfig;

/// Gates a tonic client stack on server-granted credits.
///
/// ```ignore
/// let channel = Endpoint::from_static("http://peer:50051").connect().await?;
/// let layer = CreditGateLayer::new(&AdmissionConfig::default());
/// let svc = ServiceBuilder::new().layer(layer).service(channel);
/// let client = EchoClient::new(svc);
/// ```
#[derive(Clone)]
pub struct CreditGateLayer {
    admitter: Arc<Admitter>,
}

impl CreditGateLayer {
    /// Must be called within a tokio runtime; the admitter owns the
    /// escape-hatch timer task.
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            admitter: Admitter::new(config),
        }
    }

    pub fn from_admitter(admitter: Arc<Admitter>) -> Self {
        Self { admitter }
    }

    /// The shared admitter, for inspection.
    pub fn admitter(&self) -> Arc<Admitter> {
        Arc::clone(&self.admitter)
    }
}

impl<S> Layer<S> for CreditGateLayer {
    type Service = CreditGate<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CreditGate::new(inner, Arc::clone(&self.admitter))
    }
}
