use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::app::CoapError;
use crate::message::sequence::u24;
use crate::message::{
    CoapMessage, InvalidMessage, MessageId, MessageType, RequestMethod, ResponseStatus, Token,
};
use crate::observe::observers::{ListenerId, ResourceEvent};
use crate::observe::resource::{ObservableResource, Representation};
use crate::pipeline::{ConversationKey, EndpointAddr, Inbound, Outbound, Stage};
use crate::reliability::outbound::{ExchangeEvent, SendFailed};
use crate::table::Table;

/// Notification ready to be sent below the observe stage.
#[derive(Debug, Clone)]
pub struct Notification<Endpoint> {
    pub peer: Endpoint,
    pub message: CoapMessage,
}

#[derive(Debug, Clone)]
struct Observation {
    path: String,
    etags: Vec<Vec<u8>>,
    accept: Option<u16>,
    counter: u24,
    last_message_id: Option<MessageId>,
}

/// Tracks Observe subscriptions per (peer, token) and turns resource changes into
/// notifications.
///
/// Registration happens when a successful response to a `GET` with `Observe: 0` leaves the
/// server, so the response can carry the first sequence number.
pub struct ObserveManager<Endpoint> {
    inner: Arc<Inner<Endpoint>>,
}

impl<Endpoint> Clone for ObserveManager<Endpoint> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<Endpoint> {
    observations: Table<ConversationKey<Endpoint>, Observation>,
    by_path: Table<String, HashSet<ConversationKey<Endpoint>>>,
    resources: Table<String, Arc<dyn ObservableResource>>,
    notifications: UnboundedSender<Notification<Endpoint>>,
}

fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn default_message_type(resource: &dyn ObservableResource) -> MessageType {
    if resource.notifications_confirmable() {
        MessageType::Confirmable
    } else {
        MessageType::NonConfirmable
    }
}

impl<Endpoint: EndpointAddr> ObserveManager<Endpoint> {
    pub fn new(notifications: UnboundedSender<Notification<Endpoint>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                observations: Table::new(),
                by_path: Table::new(),
                resources: Table::new(),
                notifications,
            }),
        }
    }

    /// Makes `resource` observable at `path` and starts listening to its changes.
    pub async fn attach(&self, path: &str, resource: Arc<dyn ObservableResource>) {
        let path = normalize_path(path);
        let (tx, mut rx) = unbounded_channel();
        let listener = resource.observers().on_change(tx).await;
        self.inner.resources.insert(path.clone(), resource).await;
        debug!("Observable resource attached at /{path}");

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let inner = match Weak::upgrade(&inner) {
                    Some(inner) => inner,
                    None => break,
                };
                match event {
                    ResourceEvent::Changed { message_type } => {
                        inner.fan_out(&path, message_type).await;
                    }
                    ResourceEvent::Removed => {
                        inner.broadcast_removed(&path, listener).await;
                        break;
                    }
                }
            }
        });
    }

    pub async fn is_observable(&self, path: &str) -> bool {
        self.inner.resources.contains(&normalize_path(path)).await
    }

    pub async fn observation_count(&self) -> usize {
        self.inner.observations.len().await
    }

    /// Current sequence number of the subscription, if it exists.
    pub async fn sequence(&self, peer: &Endpoint, token: &Token) -> Option<u24> {
        let key = ConversationKey::new(peer.clone(), token.clone());
        self.inner
            .observations
            .get(&key)
            .await
            .map(|observation| observation.counter)
    }

    /// Remembers the message ID a notification went out with, so a Reset naming it can end
    /// the subscription.
    pub async fn record_notification_id(
        &self,
        peer: &Endpoint,
        token: &Token,
        message_id: MessageId,
    ) {
        let key = ConversationKey::new(peer.clone(), token.clone());
        self.inner
            .observations
            .update(&key, |observation| observation.last_message_id = Some(message_id))
            .await;
    }

    /// Drops the subscription whose Confirmable notification was reset or never
    /// acknowledged.  Exchanges that merely share the token, such as our own requests to the
    /// same peer, leave it alone.
    pub async fn on_exchange_event(&self, event: &ExchangeEvent<Endpoint>) {
        if let Some(failure) = event.failure() {
            let key = ConversationKey::new(event.peer.clone(), event.token.clone());
            let notified = self
                .inner
                .observations
                .get(&key)
                .await
                .map_or(false, |observation| {
                    observation.last_message_id == Some(event.message_id)
                });
            if notified && self.inner.remove(&key).await {
                debug!(
                    "Observation by {:?} token={} cancelled: {failure}",
                    event.peer, event.token
                );
            }
        }
    }
}

impl<Endpoint: EndpointAddr> Inner<Endpoint> {
    async fn register(&self, key: ConversationKey<Endpoint>, path: String, request: &CoapMessage) -> u24 {
        let counter = u24::from_be_bytes(rand::random::<[u8; 3]>());
        let observation = Observation {
            path: path.clone(),
            etags: request.etags(),
            accept: request.accept(),
            counter,
            last_message_id: None,
        };
        if let Some(previous) = self.observations.insert(key.clone(), observation).await {
            if previous.path != path {
                self.unindex(&previous.path, &key).await;
            }
        }
        self.by_path
            .modify(|by_path| by_path.entry(path).or_default().insert(key))
            .await;
        counter
    }

    async fn remove(&self, key: &ConversationKey<Endpoint>) -> bool {
        match self.observations.remove(key).await {
            Some(observation) => {
                self.unindex(&observation.path, key).await;
                true
            }
            None => false,
        }
    }

    async fn unindex(&self, path: &str, key: &ConversationKey<Endpoint>) {
        self.by_path
            .modify(|by_path| {
                if let Some(keys) = by_path.get_mut(path) {
                    keys.remove(key);
                    if keys.is_empty() {
                        by_path.remove(path);
                    }
                }
            })
            .await;
    }

    async fn find_by_message_id(&self, peer: &Endpoint, message_id: MessageId) -> Option<ConversationKey<Endpoint>> {
        self.observations
            .read(|observations| {
                observations
                    .iter()
                    .find(|(key, observation)| {
                        key.peer == *peer && observation.last_message_id == Some(message_id)
                    })
                    .map(|(key, _)| key.clone())
            })
            .await
    }

    async fn fan_out(&self, path: &str, message_type: Option<MessageType>) {
        let resource = match self.resources.get(&path.to_string()).await {
            Some(resource) => resource,
            None => return,
        };
        let subscribers = self.by_path.get(&path.to_string()).await.unwrap_or_default();
        if subscribers.is_empty() {
            return;
        }
        let message_type = message_type.unwrap_or_else(|| default_message_type(resource.as_ref()));
        debug!("Notifying {} observers of /{path}", subscribers.len());

        // Rendered once per requested content format.
        let mut rendered: HashMap<Option<u16>, Result<Representation, CoapError>> = HashMap::new();
        for key in subscribers {
            let params = self
                .observations
                .update(&key, |observation| {
                    observation.counter = observation.counter.next();
                    (observation.counter, observation.accept, observation.etags.clone())
                })
                .await;
            let (sequence, accept, etags) = match params {
                Some(params) => params,
                None => continue,
            };
            if !rendered.contains_key(&accept) {
                let representation = resource.representation(accept).await;
                rendered.insert(accept, representation);
            }
            let built = match rendered.get(&accept) {
                Some(Ok(representation)) => {
                    notification(message_type, &key.token, sequence, representation, &etags)
                }
                Some(Err(error)) => {
                    // A non-2.xx notification ends the observation.
                    self.remove(&key).await;
                    error_notification(message_type, &key.token, error)
                }
                None => continue,
            };
            match built {
                Ok(message) => self.publish(key.peer, message),
                Err(e) => warn!("Cannot build notification for /{path}: {e}"),
            }
        }
    }

    async fn broadcast_removed(&self, path: &str, listener: ListenerId) {
        let resource = self.resources.remove(&path.to_string()).await;
        let subscribers = self.by_path.remove(&path.to_string()).await.unwrap_or_default();
        let message_type = resource
            .as_ref()
            .map_or(MessageType::NonConfirmable, |resource| {
                default_message_type(resource.as_ref())
            });
        debug!(
            "Resource /{path} removed, notifying {} observers",
            subscribers.len()
        );
        for key in subscribers {
            if self.observations.remove(&key).await.is_none() {
                continue;
            }
            let mut message = CoapMessage::new_response(message_type, ResponseStatus::NotFound);
            match message.set_token(key.token.clone()) {
                Ok(()) => self.publish(key.peer, message),
                Err(e) => warn!("Cannot build removal notice for /{path}: {e}"),
            }
        }
        if let Some(resource) = resource {
            resource.observers().unregister(listener).await;
        }
    }

    fn publish(&self, peer: Endpoint, message: CoapMessage) {
        if self.notifications.send(Notification { peer, message }).is_err() {
            debug!("Notification pump gone, dropping notification");
        }
    }
}

fn notification(
    message_type: MessageType,
    token: &Token,
    sequence: u24,
    representation: &Representation,
    etags: &[Vec<u8>],
) -> Result<CoapMessage, InvalidMessage> {
    let valid = representation.matches_any(etags);
    let status = if valid {
        ResponseStatus::Valid
    } else {
        ResponseStatus::Content
    };
    let mut message = CoapMessage::new_response(message_type, status);
    message.set_token(token.clone())?;
    message.set_observe(sequence)?;
    if valid {
        representation.apply_validators(&mut message)?;
    } else {
        representation.apply_to(&mut message)?;
    }
    Ok(message)
}

fn error_notification(
    message_type: MessageType,
    token: &Token,
    error: &CoapError,
) -> Result<CoapMessage, InvalidMessage> {
    let mut message = CoapMessage::new_response(message_type, error.status());
    message.set_token(token.clone())?;
    message.set_payload(error.message.clone().into_bytes())?;
    Ok(message)
}

fn is_observe_request(request: &CoapMessage, registration: u24) -> bool {
    request.method() == Some(RequestMethod::Get) && request.observe() == Some(registration)
}

#[async_trait]
impl<Endpoint: EndpointAddr> Stage<Endpoint> for ObserveManager<Endpoint> {
    async fn handle_inbound(&self, message: &mut CoapMessage, peer: &Endpoint) -> Inbound {
        if message.message_type() == MessageType::Reset && message.is_empty_message() {
            if let Some(key) = self.inner.find_by_message_id(peer, message.message_id()).await {
                self.inner.remove(&key).await;
                debug!("Observation by {peer:?} token={} reset", key.token);
                return Inbound::Consume;
            }
        } else if is_observe_request(message, u24::from(1u8)) {
            let key = ConversationKey::new(peer.clone(), message.token().clone());
            if self.inner.remove(&key).await {
                debug!("Observation by {peer:?} token={} deregistered", key.token);
            }
        }
        Inbound::Forward
    }

    async fn handle_outbound(
        &self,
        message: &mut CoapMessage,
        peer: &Endpoint,
        request: Option<&CoapMessage>,
    ) -> Result<Outbound, SendFailed> {
        let request = match request {
            Some(request) if message.is_response() && is_observe_request(request, u24::MIN) => {
                request
            }
            _ => return Ok(Outbound::Forward),
        };
        let key = ConversationKey::new(peer.clone(), message.token().clone());
        let path = normalize_path(&request.uri_path());
        let successful = message.status().map_or(false, ResponseStatus::is_success);
        if successful && self.inner.resources.contains(&path).await {
            let sequence = self.inner.register(key, path, request).await;
            message.set_observe(sequence).map_err(anyhow::Error::from)?;
            debug!("Observation of /{} registered by {peer:?}", request.uri_path());
        } else if self.inner.remove(&key).await {
            debug!("Observation by {peer:?} ended by {}", message.code());
        }
        Ok(Outbound::Forward)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::observe::observers::Observers;
    use crate::reliability::outbound::ExchangeEventKind;

    #[derive(Default, Debug, Clone, PartialEq, Eq, Hash)]
    struct TestEndpoint(i32);

    #[derive(Default)]
    struct Thermometer {
        observers: Observers,
        renders: AtomicUsize,
        confirmable: bool,
        failing: bool,
    }

    #[async_trait]
    impl ObservableResource for Thermometer {
        fn observers(&self) -> &Observers {
            &self.observers
        }

        async fn representation(&self, accept: Option<u16>) -> Result<Representation, CoapError> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            if self.failing {
                return Err(CoapError::internal("sensor offline"));
            }
            Ok(Representation::new("21.5")
                .content_format(accept.unwrap_or(0))
                .etag(vec![0xAB]))
        }

        fn notifications_confirmable(&self) -> bool {
            self.confirmable
        }
    }

    type Pump = UnboundedReceiver<Notification<TestEndpoint>>;

    async fn attached(resource: Arc<Thermometer>) -> (ObserveManager<TestEndpoint>, Pump) {
        let (tx, rx) = unbounded_channel();
        let manager = ObserveManager::new(tx);
        manager.attach("/temp", resource).await;
        (manager, rx)
    }

    fn observe_request(token: u8, observe: u8, etag: Option<Vec<u8>>) -> CoapMessage {
        let mut request = CoapMessage::new_request(MessageType::Confirmable, RequestMethod::Get);
        request.set_message_id(token as u16);
        request.set_token(Token::new(vec![token]).unwrap()).unwrap();
        request.set_uri_path("temp").unwrap();
        request.set_observe(u24::from(observe)).unwrap();
        if let Some(etag) = etag {
            request.add_etag(etag).unwrap();
        }
        request
    }

    async fn register(
        manager: &ObserveManager<TestEndpoint>,
        peer: &TestEndpoint,
        request: &CoapMessage,
    ) -> CoapMessage {
        let mut response = CoapMessage::response_to(request, ResponseStatus::Content);
        let outcome = manager
            .handle_outbound(&mut response, peer, Some(request))
            .await
            .unwrap();
        assert_eq!(outcome, Outbound::Forward);
        response
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_sets_sequence() {
        let (manager, _pump) = attached(Arc::new(Thermometer::default())).await;
        let peer = TestEndpoint(1);
        let request = observe_request(1, 0, None);
        let response = register(&manager, &peer, &request).await;

        let sequence = manager.sequence(&peer, request.token()).await;
        assert!(sequence.is_some());
        assert_eq!(response.observe(), sequence);
        assert_eq!(manager.observation_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_response_leaves_no_registration() {
        let (manager, _pump) = attached(Arc::new(Thermometer::default())).await;
        let peer = TestEndpoint(1);
        let request = observe_request(1, 0, None);
        let mut response = CoapMessage::response_to(&request, ResponseStatus::NotFound);
        manager
            .handle_outbound(&mut response, &peer, Some(&request))
            .await
            .unwrap();
        assert!(response.observe().is_none());
        assert_eq!(manager.observation_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unattached_path_not_registered() {
        let (tx, _rx) = unbounded_channel();
        let manager = ObserveManager::<TestEndpoint>::new(tx);
        let request = observe_request(1, 0, None);
        let response = register(&manager, &TestEndpoint(1), &request).await;
        assert!(response.observe().is_none());
        assert_eq!(manager.observation_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_etag_notifies_valid() {
        let resource = Arc::new(Thermometer::default());
        let (manager, mut pump) = attached(resource.clone()).await;
        let peer = TestEndpoint(1);
        let request = observe_request(1, 0, Some(vec![0xAB]));
        let response = register(&manager, &peer, &request).await;

        resource.observers().notify_change().await;
        let notification = pump.recv().await.unwrap();
        assert_eq!(notification.peer, peer);
        let message = notification.message;
        assert_eq!(message.status(), Some(ResponseStatus::Valid));
        assert!(message.payload().is_empty());
        assert_eq!(message.token(), request.token());
        assert_eq!(message.observe(), response.observe().map(u24::next));
        assert_eq!(message.message_type(), MessageType::NonConfirmable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_renders_once_per_content_format() {
        let resource = Arc::new(Thermometer::default());
        let (manager, mut pump) = attached(resource.clone()).await;
        for peer in 1..=3 {
            register(&manager, &TestEndpoint(peer), &observe_request(1, 0, None)).await;
        }
        let mut json = observe_request(2, 0, None);
        json.set_option(
            crate::message::option::CoapOption::Accept,
            crate::message::option::OptionValue::UInt(50),
        )
        .unwrap();
        register(&manager, &TestEndpoint(1), &json).await;

        resource.observers().notify_change().await;
        for _ in 0..4 {
            let notification = pump.recv().await.unwrap();
            assert_eq!(notification.message.status(), Some(ResponseStatus::Content));
            assert_eq!(notification.message.payload(), b"21.5");
            assert!(notification.message.observe().is_some());
        }
        assert_eq!(resource.renders.load(Ordering::SeqCst), 2);

        resource.observers().notify_change().await;
        let again = pump.recv().await.unwrap();
        let previous = manager
            .sequence(&again.peer, again.message.token())
            .await
            .unwrap();
        assert_eq!(again.message.observe(), Some(previous));
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_and_override_message_type() {
        let resource = Arc::new(Thermometer {
            confirmable: true,
            ..Thermometer::default()
        });
        let (manager, mut pump) = attached(resource.clone()).await;
        register(&manager, &TestEndpoint(1), &observe_request(1, 0, None)).await;

        resource.observers().notify_change().await;
        assert_eq!(
            pump.recv().await.unwrap().message.message_type(),
            MessageType::Confirmable
        );
        resource
            .observers()
            .notify_change_as(MessageType::NonConfirmable)
            .await;
        assert_eq!(
            pump.recv().await.unwrap().message.message_type(),
            MessageType::NonConfirmable
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_with_observe_one() {
        let (manager, _pump) = attached(Arc::new(Thermometer::default())).await;
        let peer = TestEndpoint(1);
        register(&manager, &peer, &observe_request(1, 0, None)).await;

        let mut cancel = observe_request(1, 1, None);
        let outcome = manager.handle_inbound(&mut cancel, &peer).await;
        assert_eq!(outcome, Inbound::Forward);
        assert_eq!(manager.observation_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_of_notification_cancels() {
        let (manager, _pump) = attached(Arc::new(Thermometer::default())).await;
        let peer = TestEndpoint(1);
        let request = observe_request(1, 0, None);
        register(&manager, &peer, &request).await;
        manager
            .record_notification_id(&peer, request.token(), 777)
            .await;

        let mut unrelated = CoapMessage::reset(778);
        assert_eq!(manager.handle_inbound(&mut unrelated, &peer).await, Inbound::Forward);
        assert_eq!(manager.observation_count().await, 1);

        let mut reset = CoapMessage::reset(777);
        assert_eq!(manager.handle_inbound(&mut reset, &peer).await, Inbound::Consume);
        assert_eq!(manager.observation_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_failure_cancels() {
        let (manager, _pump) = attached(Arc::new(Thermometer::default())).await;
        let peer = TestEndpoint(1);
        let request = observe_request(1, 0, None);
        register(&manager, &peer, &request).await;

        let acknowledged = ExchangeEvent {
            peer: peer.clone(),
            token: request.token().clone(),
            message_id: 5,
            kind: ExchangeEventKind::Acknowledged,
        };
        manager
            .record_notification_id(&peer, request.token(), 5)
            .await;
        manager.on_exchange_event(&acknowledged).await;
        assert_eq!(manager.observation_count().await, 1);

        let timed_out = ExchangeEvent {
            kind: ExchangeEventKind::TimedOut { transmissions: 5 },
            ..acknowledged
        };
        manager.on_exchange_event(&timed_out).await;
        assert_eq!(manager.observation_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrelated_exchange_with_same_token() {
        let (manager, _pump) = attached(Arc::new(Thermometer::default())).await;
        let peer = TestEndpoint(1);
        let request = observe_request(1, 0, None);
        register(&manager, &peer, &request).await;
        manager
            .record_notification_id(&peer, request.token(), 40)
            .await;

        for kind in [ExchangeEventKind::Reset, ExchangeEventKind::TimedOut { transmissions: 5 }] {
            let client_exchange = ExchangeEvent {
                peer: peer.clone(),
                token: request.token().clone(),
                message_id: 41,
                kind,
            };
            manager.on_exchange_event(&client_exchange).await;
        }
        assert_eq!(manager.observation_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_broadcasts_not_found() {
        let resource = Arc::new(Thermometer::default());
        let (manager, mut pump) = attached(resource.clone()).await;
        register(&manager, &TestEndpoint(1), &observe_request(1, 0, None)).await;
        register(&manager, &TestEndpoint(2), &observe_request(2, 0, None)).await;

        resource.observers().resource_removed().await;
        for _ in 0..2 {
            let notification = pump.recv().await.unwrap();
            assert_eq!(notification.message.status(), Some(ResponseStatus::NotFound));
            assert!(notification.message.observe().is_none());
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(manager.observation_count().await, 0);
        assert!(!manager.is_observable("/temp").await);
        assert_eq!(resource.observers().listener_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_render_ends_observation() {
        let resource = Arc::new(Thermometer {
            failing: true,
            ..Thermometer::default()
        });
        let (manager, mut pump) = attached(resource.clone()).await;
        register(&manager, &TestEndpoint(1), &observe_request(1, 0, None)).await;

        resource.observers().notify_change().await;
        let notification = pump.recv().await.unwrap();
        assert_eq!(
            notification.message.status(),
            Some(ResponseStatus::InternalServerError)
        );
        assert_eq!(manager.observation_count().await, 0);
    }
}
