use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{Request, Response};
use metrics::counter;
use tonic::body::BoxBody;
use tonic::Status;
use tower::Service;

use super::Controller;
use crate::metadata;

/// Server-side unary interceptor.
///
/// For every request: validates the piggybacked metadata, registers or
/// refreshes the client, computes its credit grant, runs the inner service,
/// optionally sheds the response under AQM, stamps the grant onto the
/// response headers, and gives the controller a chance to run its
/// once-per-RTT pool update.
#[derive(Clone)]
pub struct Admission<S> {
    inner: S,
    controller: Arc<Controller>,
}

impl<S> Admission<S> {
    pub(super) fn new(inner: S, controller: Arc<Controller>) -> Self {
        Self { inner, controller }
    }
}

impl<S, B> Service<Request<B>> for Admission<S>
where
    S: Service<Request<B>, Response = Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
{
    type Response = Response<BoxBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let Some(tags) = metadata::request_tags(req.headers()) else {
            counter!("seawall_malformed_requests_total", 1);
            return Box::pin(async {
                Ok::<_, S::Error>(Status::invalid_argument("missing metadata").to_http())
            });
        };

        let controller = Arc::clone(&self.controller);
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            trace!(
                method = req.uri().path(),
                client = %tags.client,
                request = %tags.request,
                demand = tags.demand,
                "request received"
            );
            controller.register(tags.client, tags.demand);
            let granted = controller.issue(tags.client, tags.demand);

            let result = match inner.call(req).await {
                Ok(mut response) => {
                    let shed = controller.load_shedding()
                        && controller.delay_cell().load().await >= controller.aqm_delay();
                    if shed {
                        counter!("seawall_shed_responses_total", 1);
                        warn!(client = %tags.client, "queueing delay beyond AQM threshold, shedding response");
                        Ok(Status::resource_exhausted(
                            "server queueing delay beyond AQM threshold",
                        )
                        .to_http())
                    } else {
                        metadata::apply_credits(response.headers_mut(), granted);
                        Ok(response)
                    }
                }
                Err(error) => Err(error),
            };
            controller.tick();
            result
        })
    }
}
