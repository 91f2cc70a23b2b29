use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::app::path_matcher::{key_from_path, MatchedResult, PathMatcher};
use crate::app::{CoapError, CoapRequest, RequestHandler, Responder};
use crate::message::{RequestMethod, ResponseStatus};
use crate::observe::ObservableResource;

/// Maps URI paths to per-method request handlers.  Requests are routed to the most specific
/// registered path; the rest of the path is left in [`CoapRequest::unmatched_path`].
pub struct Router<Endpoint> {
    routes: PathMatcher<Route<Endpoint>>,
    observables: Vec<(String, Arc<dyn ObservableResource>)>,
}

struct Route<Endpoint> {
    handlers: HashMap<RequestMethod, Box<dyn RequestHandler<Endpoint>>>,
    default_handler: Option<Box<dyn RequestHandler<Endpoint>>>,
}

impl<Endpoint> Clone for Route<Endpoint> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
            default_handler: self.default_handler.clone(),
        }
    }
}

impl<Endpoint> Default for Route<Endpoint> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            default_handler: None,
        }
    }
}

impl<Endpoint> Clone for Router<Endpoint> {
    fn clone(&self) -> Self {
        Self {
            routes: self.routes.clone(),
            observables: self.observables.clone(),
        }
    }
}

impl<Endpoint: Send + Sync + 'static> Default for Router<Endpoint> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Endpoint: Send + Sync + 'static> Router<Endpoint> {
    pub fn new() -> Self {
        Self {
            routes: PathMatcher::new_empty(),
            observables: Vec::new(),
        }
    }

    /// Set a request handler for "Get" requests.
    pub fn get(self, path: &str, handler: impl RequestHandler<Endpoint>) -> Self {
        self.route(path, RequestMethod::Get, handler)
    }

    /// Set a request handler for "Post" requests.
    pub fn post(self, path: &str, handler: impl RequestHandler<Endpoint>) -> Self {
        self.route(path, RequestMethod::Post, handler)
    }

    /// Set a request handler for "Put" requests.
    pub fn put(self, path: &str, handler: impl RequestHandler<Endpoint>) -> Self {
        self.route(path, RequestMethod::Put, handler)
    }

    /// Set a request handler for "Delete" requests.
    pub fn delete(self, path: &str, handler: impl RequestHandler<Endpoint>) -> Self {
        self.route(path, RequestMethod::Delete, handler)
    }

    pub fn route(
        mut self,
        path: &str,
        method: RequestMethod,
        handler: impl RequestHandler<Endpoint>,
    ) -> Self {
        self.route_mut(path).handlers.insert(method, Box::new(handler));
        self
    }

    /// Catch-all for methods without a specific handler at `path`, overriding the default
    /// "4.05 Method not allowed".
    pub fn default_handler(mut self, path: &str, handler: impl RequestHandler<Endpoint>) -> Self {
        self.route_mut(path).default_handler = Some(Box::new(handler));
        self
    }

    /// Serves `resource` for "Get" at `path` and lets clients observe it.  Call
    /// [`crate::observe::Observers::notify_change`] on the resource's observers to push
    /// updates.
    ///
    /// For more information, see [RFC 7641](https://datatracker.ietf.org/doc/html/rfc7641)
    pub fn observable(mut self, path: &str, resource: impl ObservableResource) -> Self {
        let resource: Arc<dyn ObservableResource> = Arc::new(resource);
        self.observables.push((path.to_string(), resource.clone()));
        self.route(path, RequestMethod::Get, ObservableGet { resource })
    }

    fn route_mut(&mut self, path: &str) -> &mut Route<Endpoint> {
        self.routes.get_or_default(key_from_path(path))
    }
}

#[async_trait]
impl<Endpoint: Send + Sync + 'static> RequestHandler<Endpoint> for Router<Endpoint> {
    async fn process(&self, mut request: CoapRequest<Endpoint>, responder: Responder) {
        let path = key_from_path(&request.path());
        let (route, matched_index) = match self.routes.lookup(&path) {
            Some(MatchedResult {
                value,
                matched_index,
            }) => (value, matched_index),
            None => {
                debug!("No resource for /{}", path.join("/"));
                return responder.fail(CoapError::not_found());
            }
        };
        request.unmatched_path = Vec::from(&path[matched_index..]);

        let handler = request
            .method()
            .and_then(|method| route.handlers.get(&method))
            .or(route.default_handler.as_ref());
        match handler {
            Some(handler) => handler.process(request, responder).await,
            None => responder.fail(CoapError::method_not_allowed()),
        }
    }

    fn observable_resources(&self) -> Vec<(String, Arc<dyn ObservableResource>)> {
        self.observables.clone()
    }
}

/// "Get" handler rendering an observable resource, answering 2.03 when the client already
/// holds the current representation.
#[derive(Clone)]
struct ObservableGet {
    resource: Arc<dyn ObservableResource>,
}

impl ObservableGet {
    async fn render<Endpoint>(
        &self,
        request: &CoapRequest<Endpoint>,
    ) -> Result<crate::app::CoapResponse, CoapError> {
        let representation = self
            .resource
            .representation(request.message.accept())
            .await?;
        let mut response = request.new_response();
        if representation.matches_any(&request.message.etags()) {
            response.set_status(ResponseStatus::Valid);
            representation
                .apply_validators(&mut response.message)
                .map_err(CoapError::internal)?;
        } else {
            representation
                .apply_to(&mut response.message)
                .map_err(CoapError::internal)?;
        }
        Ok(response)
    }
}

#[async_trait]
impl<Endpoint: Send + Sync + 'static> RequestHandler<Endpoint> for ObservableGet {
    async fn process(&self, request: CoapRequest<Endpoint>, responder: Responder) {
        responder.complete(self.render(&request).await);
    }
}
