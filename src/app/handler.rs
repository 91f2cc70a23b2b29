use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dyn_clone::DynClone;
use tokio::sync::oneshot;

use crate::app::{CoapError, CoapRequest, CoapResponse};
use crate::observe::ObservableResource;

pub type ResponseResult = Result<CoapResponse, CoapError>;

/// Single-use slot the application fulfils with the response to one request.  Dropping it
/// unfulfilled answers the request with 5.00.
#[derive(Debug)]
pub struct Responder {
    slot: oneshot::Sender<ResponseResult>,
}

impl Responder {
    pub(crate) fn new() -> (Self, oneshot::Receiver<ResponseResult>) {
        let (slot, rx) = oneshot::channel();
        (Self { slot }, rx)
    }

    pub fn respond(self, response: CoapResponse) {
        self.complete(Ok(response));
    }

    pub fn fail(self, error: CoapError) {
        self.complete(Err(error));
    }

    pub fn complete(self, result: ResponseResult) {
        // The engine stops waiting only when it shuts down.
        let _ = self.slot.send(result);
    }
}

/// Upstream contract of the engine: process one request and eventually fulfil its
/// [`Responder`], from this task or any other.
#[async_trait]
pub trait RequestHandler<Endpoint>: DynClone + Send + Sync + 'static {
    async fn process(&self, request: CoapRequest<Endpoint>, responder: Responder);

    /// Resources the engine should make observable, keyed by path.
    fn observable_resources(&self) -> Vec<(String, Arc<dyn ObservableResource>)> {
        Vec::new()
    }
}

dyn_clone::clone_trait_object!(<Endpoint> RequestHandler<Endpoint>);

#[async_trait]
impl<Endpoint, F, R> RequestHandler<Endpoint> for F
where
    Endpoint: Send + Sync + 'static,
    F: Fn(CoapRequest<Endpoint>) -> R + Sync + Send + Clone + 'static,
    R: Future<Output = ResponseResult> + Send,
{
    async fn process(&self, request: CoapRequest<Endpoint>, responder: Responder) {
        responder.complete((self)(request).await);
    }
}
