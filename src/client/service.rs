use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{Request, Response};
use tonic::Status;
use tower::{BoxError, Service};
use uuid::Uuid;

use super::{AdmitError, Admitter};
use crate::metadata::{self, RequestTags};

/// Client-side unary interceptor.
///
/// Every outbound call first passes the admitter (bounded queue + credit
/// gate), then carries `{demand, id, reqid}` on its headers; the server's
/// piggybacked grant on the response is folded back into the balance.
#[derive(Clone)]
pub struct CreditGate<S> {
    inner: S,
    admitter: Arc<Admitter>,
}

impl<S> CreditGate<S> {
    pub(super) fn new(inner: S, admitter: Arc<Admitter>) -> Self {
        Self { inner, admitter }
    }
}

impl<S, B, RB> Service<Request<B>> for CreditGate<S>
where
    S: Service<Request<B>, Response = Response<RB>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response<RB>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let admitter = Arc::clone(&self.admitter);
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            // Originating calls mint a request id; calls relayed on behalf
            // of an upstream keep the one already attached.
            let request = match metadata::request_id(req.headers()) {
                Some(inherited) => inherited,
                None => Uuid::new_v4(),
            };

            let demand = admitter.admit().await.map_err(exhausted)?;
            metadata::apply_request_tags(
                req.headers_mut(),
                &RequestTags {
                    demand,
                    client: admitter.id(),
                    request,
                },
            );
            trace!(client = %admitter.id(), request = %request, demand, "dispatching request");

            let response = inner.call(req).await.map_err(Into::into)?;

            admitter.absorb_grant(metadata::credits(response.headers()));
            Ok(response)
        })
    }
}

fn exhausted(error: AdmitError) -> BoxError {
    Box::new(Status::resource_exhausted(error.to_string()))
}
