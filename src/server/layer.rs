use std::sync::Arc;

use tower::Layer;

use super::{Admission, Controller};
use crate::config::AdmissionConfig;
use crate::delay::DelaySource;

/// Applies credit-based admission control to a tonic server stack.
///
/// ```ignore
/// let layer = AdmissionLayer::new(&AdmissionConfig::default(), TimerLagProbe::spawn_default());
/// Server::builder()
///     .layer(layer)
///     .add_service(svc)
///     .serve(addr)
///     .await?;
/// ```
#[derive(Clone)]
pub struct AdmissionLayer {
    controller: Arc<Controller>,
}

impl AdmissionLayer {
    /// Must be called within a tokio runtime; the controller owns a
    /// background task.
    pub fn new(config: &AdmissionConfig, source: impl DelaySource) -> Self {
        Self {
            controller: Controller::new(config, source),
        }
    }

    pub fn from_controller(controller: Arc<Controller>) -> Self {
        Self { controller }
    }

    /// The shared controller, for inspection.
    pub fn controller(&self) -> Arc<Controller> {
        Arc::clone(&self.controller)
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = Admission<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Admission::new(inner, Arc::clone(&self.controller))
    }
}
