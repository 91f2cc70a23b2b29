//! The protocol engine: runs every datagram through the stage pipeline and connects the
//! pipeline to the request handler on the server side and to response callbacks on the
//! client side.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::oneshot;
use tokio::time::{self, Instant};

use crate::app::{CoapError, CoapRequest, RequestHandler, Responder, Router};
use crate::blockwise::Blockwise;
use crate::codec::MessageError;
use crate::config::ProtocolConfig;
use crate::identifiers::{MessageIdFactory, TokenFactory};
use crate::message::option::content_format;
use crate::message::sequence::u24;
use crate::message::{CoapMessage, MessageClass, MessageId, MessageType, ResponseStatus, Token};
use crate::observe::{Notification, ObserveManager};
use crate::packet_handler::{IntoHandler, PacketHandler};
use crate::pipeline::{ConversationKey, EndpointAddr, Inbound, Outbound, Outbox, Stage};
use crate::reliability::inbound::InboundReliability;
use crate::reliability::outbound::{
    ExchangeEvent, ExchangeEventKind, OutboundReliability, SendFailed,
};
use crate::table::Table;

#[cfg(test)]
mod tests;

/// Position of the observe stage.  Notifications enter the pipeline right below it.
const OBSERVE_STAGE: usize = 3;

/// Downstream contract: receives the outcome of a request sent with
/// [`ProtocolEngine::send_request`].
///
/// Failures default to [`ResponseCallback::on_misc_error`] so simple callbacks only need
/// to handle responses.
pub trait ResponseCallback<Endpoint>: Send + Sync {
    /// Called for the response, and for every notification while an observation lasts.
    fn on_response(&self, peer: &Endpoint, response: CoapMessage);

    fn on_reset(&self, _peer: &Endpoint) {
        self.on_misc_error(SendFailed::Reset);
    }

    fn on_timeout(&self, _peer: &Endpoint, transmissions: usize) {
        self.on_misc_error(SendFailed::NoReply(transmissions));
    }

    fn on_misc_error(&self, _error: SendFailed) {}
}

#[derive(Clone)]
struct Conversation<Endpoint> {
    /// Tells this conversation apart from a later one that reuses the token.
    id: u64,
    callback: Arc<dyn ResponseCallback<Endpoint>>,
    last_notification: Option<(u24, Instant)>,
}

pub struct ProtocolEngine<Endpoint> {
    inner: Arc<EngineInner<Endpoint>>,
}

impl<Endpoint> Clone for ProtocolEngine<Endpoint> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct EngineInner<Endpoint> {
    /// In inbound order; outbound messages walk it backwards.
    stages: Vec<Arc<dyn Stage<Endpoint>>>,
    outbound: Arc<OutboundReliability<Endpoint>>,
    observe: ObserveManager<Endpoint>,
    handler: Arc<dyn RequestHandler<Endpoint>>,
    tokens: TokenFactory<Endpoint>,
    conversations: Table<ConversationKey<Endpoint>, Conversation<Endpoint>>,
    next_conversation_id: AtomicU64,
    /// How long to wait for a separate response once the request was acknowledged.
    separate_response_timeout: Duration,
    outbox: Outbox<Endpoint>,
}

impl<Endpoint: EndpointAddr> ProtocolEngine<Endpoint> {
    pub fn builder<Handler>(handler: Handler) -> EngineBuilder<Handler>
    where
        Handler: RequestHandler<Endpoint>,
    {
        EngineBuilder {
            config: ProtocolConfig::default(),
            handler,
        }
    }

    /// Assembles the pipeline and starts its background tasks.  Everything the engine sends
    /// ends up in `outbox`.
    pub async fn new(
        config: ProtocolConfig,
        handler: impl RequestHandler<Endpoint>,
        outbox: Outbox<Endpoint>,
    ) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        let (notifications_tx, notifications_rx) = unbounded_channel();

        let outbound = Arc::new(OutboundReliability::new(
            config.transmission,
            MessageIdFactory::new(config.exchange_lifetime),
            outbox.clone(),
            events_tx,
        ));
        let inbound = Arc::new(InboundReliability::new(&config, outbox.clone()));
        let blockwise = Arc::new(Blockwise::new(&config));
        let observe = ObserveManager::new(notifications_tx);
        for (path, resource) in handler.observable_resources() {
            observe.attach(&path, resource).await;
        }

        let stages: Vec<Arc<dyn Stage<Endpoint>>> = vec![
            outbound.clone(),
            inbound,
            blockwise,
            Arc::new(observe.clone()),
        ];
        let inner = Arc::new(EngineInner {
            stages,
            outbound,
            observe,
            handler: Arc::new(handler),
            tokens: TokenFactory::new(config.token_length),
            conversations: Table::new(),
            next_conversation_id: AtomicU64::new(0),
            separate_response_timeout: config.exchange_lifetime,
            outbox,
        });
        spawn_event_router(Arc::downgrade(&inner), events_rx);
        spawn_notification_pump(Arc::downgrade(&inner), notifications_rx);
        Self { inner }
    }

    /// Entry point for every received datagram.  Decoding failures are answered here: a
    /// Reset when the message ID survived, a 4.02 for a bad critical option in a request.
    pub async fn handle(&self, decoded: Result<CoapMessage, MessageError>, peer: Endpoint) {
        match decoded {
            Ok(message) => self.inner.process_inbound(message, peer).await,
            Err(error) => self.inner.reject(error, peer).await,
        }
    }

    /// Sends `request` to `peer` and routes whatever comes back to `callback`.  A token is
    /// generated when the request has none.  Failures, including ones that prevent sending
    /// at all, are reported to the callback; the token is returned only when the request
    /// went out.
    pub async fn send_request(
        &self,
        request: CoapMessage,
        peer: Endpoint,
        callback: Arc<dyn ResponseCallback<Endpoint>>,
    ) -> Option<Token> {
        match self.inner.send_request(request, &peer, callback.clone()).await {
            Ok(token) => Some(token),
            Err(e) => {
                debug!("Request to {peer:?} failed: {e}");
                callback.on_misc_error(e);
                None
            }
        }
    }

    /// Sends `request` and waits for the first response, Reset or timeout.
    pub async fn request(
        &self,
        request: CoapMessage,
        peer: Endpoint,
    ) -> Result<CoapMessage, SendFailed> {
        let (tx, rx) = oneshot::channel();
        let callback = Arc::new(Completion {
            slot: Mutex::new(Some(tx)),
        });
        if let Some(token) = self.send_request(request, peer.clone(), callback).await {
            let result = rx.await.unwrap_or_else(|_| {
                Err(SendFailed::Transmission(anyhow::anyhow!("engine shut down")))
            });
            // One answer is all we want, so an observation this started is dropped.
            self.cancel_request(&peer, &token).await;
            return result;
        }
        rx.await.unwrap_or_else(|_| {
            Err(SendFailed::Transmission(anyhow::anyhow!("request not sent")))
        })
    }

    /// Forgets the conversation for `token`.  Retransmissions stop, later responses are
    /// treated as unsolicited.
    pub async fn cancel_request(&self, peer: &Endpoint, token: &Token) {
        let key = ConversationKey::new(peer.clone(), token.clone());
        self.inner.conversations.remove(&key).await;
        self.inner.outbound.cancel(peer, token).await;
        self.inner.tokens.release(peer, token).await;
    }

    pub fn observe_manager(&self) -> &ObserveManager<Endpoint> {
        &self.inner.observe
    }

    pub async fn open_conversations(&self) -> usize {
        self.inner.conversations.len().await
    }
}

impl<Endpoint: EndpointAddr> EngineInner<Endpoint> {
    async fn process_inbound(&self, mut message: CoapMessage, peer: Endpoint) {
        trace!("Incoming from {peer:?}: {message}");
        for (index, stage) in self.stages.iter().enumerate() {
            match stage.handle_inbound(&mut message, &peer).await {
                Inbound::Forward => {}
                Inbound::Consume => return,
                Inbound::Reply(reply) => {
                    if let Err(e) = self.send_down(reply, &peer, Some(&message), index).await {
                        warn!("Cannot reply to {peer:?}: {e}");
                    }
                    return;
                }
            }
        }
        match message.code() {
            MessageClass::Request(_) => self.serve_request(message, peer).await,
            MessageClass::Response(_) => self.deliver_response(message, peer).await,
            MessageClass::Empty => {
                debug!("Ignoring empty {:?} from {peer:?}", message.message_type());
            }
            MessageClass::Reserved(code) => {
                debug!("Ignoring message with reserved code {code:#04x} from {peer:?}");
            }
        }
    }

    async fn reject(&self, error: MessageError, peer: Endpoint) {
        match error {
            MessageError::Header {
                message_id: Some(message_id),
                fault,
            } => {
                debug!("Resetting malformed message from {peer:?}: {fault}");
                self.outbox.send_control(CoapMessage::reset(message_id), peer);
            }
            MessageError::Header {
                message_id: None,
                fault,
            } => {
                debug!("Dropping malformed datagram from {peer:?}: {fault}");
            }
            MessageError::BadOption {
                message_id,
                token,
                message_type,
                number,
                fault,
            } => {
                debug!("Bad option {number} from {peer:?}: {fault}");
                let reply_type = match message_type {
                    MessageType::Confirmable => MessageType::Acknowledgement,
                    MessageType::NonConfirmable => MessageType::NonConfirmable,
                    _ => return,
                };
                let mut reply = CoapMessage::new_response(reply_type, ResponseStatus::BadOption);
                reply.set_message_id(message_id);
                if reply.set_token(token).is_err() {
                    return;
                }
                let _ = reply.set_content_format(content_format::TEXT_PLAIN);
                let _ = reply.set_payload(fault.to_string().into_bytes());
                if reply_type == MessageType::Acknowledgement {
                    self.outbox.send_control(reply, peer);
                } else if let Err(e) = self.send_down(reply, &peer, None, 1).await {
                    warn!("Cannot send 4.02 to {peer:?}: {e}");
                }
            }
        }
    }

    /// Runs `message` through the outbound side of the stages below `below` and hands it to
    /// the outbox.  Returns the message ID it went out with, `None` if a stage consumed it.
    async fn send_down(
        &self,
        mut message: CoapMessage,
        peer: &Endpoint,
        request: Option<&CoapMessage>,
        below: usize,
    ) -> Result<Option<MessageId>, SendFailed> {
        let below = below.min(self.stages.len());
        for stage in self.stages[..below].iter().rev() {
            if stage.handle_outbound(&mut message, peer, request).await? == Outbound::Consume {
                return Ok(None);
            }
        }
        let message_id = message.message_id();
        self.outbox.send(message, peer.clone())?;
        Ok(Some(message_id))
    }

    /// Hands the request to the application and waits, without blocking a worker, for the
    /// response slot to be fulfilled.
    async fn serve_request(&self, request: CoapMessage, peer: Endpoint) {
        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "Received from [{peer:?}]: {} /{}",
                request.code(),
                request.uri_path()
            );
        }
        let (responder, slot) = Responder::new();
        let handler = self.handler.clone();
        let application_request = CoapRequest::new(request.clone(), peer.clone());
        tokio::spawn(async move {
            handler.process(application_request, responder).await;
        });

        let mut response = match slot.await {
            Ok(Ok(response)) => response.message,
            Ok(Err(error)) => error.into_response(&request),
            Err(_) => {
                CoapError::internal("request handler did not respond").into_response(&request)
            }
        };
        address_to(&mut response, &request);
        if let Err(e) = self.send_down(response, &peer, Some(&request), self.stages.len()).await {
            warn!("Cannot respond to {peer:?}: {e}");
        }
    }

    async fn deliver_response(&self, response: CoapMessage, peer: Endpoint) {
        let key = ConversationKey::new(peer.clone(), response.token().clone());
        let conversation = match self.conversations.get(&key).await {
            Some(conversation) => conversation,
            None => {
                if response.message_type() == MessageType::NonConfirmable {
                    debug!("Rejecting unsolicited response from {peer:?}");
                    self.outbox
                        .send_control(CoapMessage::reset(response.message_id()), peer);
                } else {
                    debug!("Response from {peer:?} matches no request, ignoring");
                }
                return;
            }
        };

        let successful = response.status().map_or(false, ResponseStatus::is_success);
        match response.observe() {
            Some(sequence) if successful => {
                let now = Instant::now();
                let fresh = self
                    .conversations
                    .update(&key, |conversation| {
                        let fresh = conversation
                            .last_notification
                            .map_or(true, |(previous, at)| {
                                sequence.is_fresher_than(previous, now.duration_since(at))
                            });
                        if fresh {
                            conversation.last_notification = Some((sequence, now));
                        }
                        fresh
                    })
                    .await
                    .unwrap_or(false);
                if !fresh {
                    debug!("Dropping reordered notification {sequence} from {peer:?}");
                    return;
                }
            }
            _ => {
                self.conversations.remove(&key).await;
                self.tokens.release(&peer, &key.token).await;
            }
        }
        conversation.callback.on_response(&peer, response);
    }

    async fn send_request(
        &self,
        mut request: CoapMessage,
        peer: &Endpoint,
        callback: Arc<dyn ResponseCallback<Endpoint>>,
    ) -> Result<Token, SendFailed> {
        let token = if request.token().is_empty() {
            let token = self
                .tokens
                .next_token(peer)
                .await
                .map_err(|e| SendFailed::Transmission(e.into()))?;
            request
                .set_token(token.clone())
                .map_err(anyhow::Error::from)?;
            token
        } else {
            let token = request.token().clone();
            self.tokens.reserve(peer, token.clone()).await;
            token
        };

        let key = ConversationKey::new(peer.clone(), token.clone());
        let conversation = Conversation {
            id: self.next_conversation_id.fetch_add(1, Ordering::Relaxed),
            callback,
            last_notification: None,
        };
        self.conversations.insert(key.clone(), conversation).await;
        if let Err(e) = self.send_down(request, peer, None, self.stages.len()).await {
            self.conversations.remove(&key).await;
            self.tokens.release(peer, &token).await;
            return Err(e);
        }
        Ok(token)
    }

    /// Settles the conversation an exchange belonged to.  When the request was only
    /// acknowledged and its response is still outstanding, returns the conversation to put
    /// a response deadline on.
    async fn on_exchange_event(
        &self,
        event: ExchangeEvent<Endpoint>,
    ) -> Option<(ConversationKey<Endpoint>, u64)> {
        self.observe.on_exchange_event(&event).await;
        let key = ConversationKey::new(event.peer.clone(), event.token.clone());
        let transmissions = match event.kind {
            ExchangeEventKind::Acknowledged => {
                let conversation = self.conversations.get(&key).await?;
                return match conversation.last_notification {
                    None => Some((key, conversation.id)),
                    Some(_) => None,
                };
            }
            ExchangeEventKind::Reset => None,
            ExchangeEventKind::TimedOut { transmissions } => Some(transmissions),
        };
        if let Some(conversation) = self.conversations.remove(&key).await {
            self.tokens.release(&event.peer, &event.token).await;
            match transmissions {
                Some(transmissions) => {
                    conversation.callback.on_timeout(&event.peer, transmissions)
                }
                None => conversation.callback.on_reset(&event.peer),
            }
        }
        None
    }

    /// Gives up on an acknowledged request whose separate response never came.  Does
    /// nothing if the conversation has been answered or replaced since.
    async fn expire_unanswered(&self, key: ConversationKey<Endpoint>, id: u64) {
        let expired = self
            .conversations
            .modify(|conversations| match conversations.get(&key) {
                Some(conversation)
                    if conversation.id == id && conversation.last_notification.is_none() =>
                {
                    conversations.remove(&key)
                }
                _ => None,
            })
            .await;
        if let Some(conversation) = expired {
            warn!(
                "No separate response from {:?} within {:?}",
                key.peer, self.separate_response_timeout
            );
            self.tokens.release(&key.peer, &key.token).await;
            conversation
                .callback
                .on_misc_error(SendFailed::NoResponse(self.separate_response_timeout));
        }
    }
}

/// Forces the header fields the protocol dictates for a response to `request`, whatever the
/// handler did with them.
fn address_to(response: &mut CoapMessage, request: &CoapMessage) {
    match request.message_type() {
        MessageType::Confirmable => {
            response.set_message_type(MessageType::Acknowledgement);
            response.set_message_id(request.message_id());
        }
        _ => response.set_message_type(MessageType::NonConfirmable),
    }
    let _ = response.set_token(request.token().clone());
}

fn spawn_event_router<Endpoint: EndpointAddr>(
    inner: Weak<EngineInner<Endpoint>>,
    mut events: UnboundedReceiver<ExchangeEvent<Endpoint>>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let engine = match Weak::upgrade(&inner) {
                Some(engine) => engine,
                None => break,
            };
            if let Some((key, id)) = engine.on_exchange_event(event).await {
                spawn_response_deadline(inner.clone(), engine.separate_response_timeout, key, id);
            }
        }
    });
}

fn spawn_response_deadline<Endpoint: EndpointAddr>(
    inner: Weak<EngineInner<Endpoint>>,
    timeout: Duration,
    key: ConversationKey<Endpoint>,
    id: u64,
) {
    tokio::spawn(async move {
        time::sleep(timeout).await;
        if let Some(inner) = Weak::upgrade(&inner) {
            inner.expire_unanswered(key, id).await;
        }
    });
}

/// Sends notifications one at a time so they leave in the order they were produced.
fn spawn_notification_pump<Endpoint: EndpointAddr>(
    inner: Weak<EngineInner<Endpoint>>,
    mut notifications: UnboundedReceiver<Notification<Endpoint>>,
) {
    tokio::spawn(async move {
        while let Some(Notification { peer, message }) = notifications.recv().await {
            let inner = match Weak::upgrade(&inner) {
                Some(inner) => inner,
                None => break,
            };
            let token = message.token().clone();
            match inner.send_down(message, &peer, None, OBSERVE_STAGE).await {
                Ok(Some(message_id)) => {
                    inner
                        .observe
                        .record_notification_id(&peer, &token, message_id)
                        .await;
                }
                Ok(None) => {}
                Err(e) => warn!("Cannot notify {peer:?}: {e}"),
            }
        }
    });
}

/// Adapts the callback contract to a single awaited result.
struct Completion {
    slot: Mutex<Option<oneshot::Sender<Result<CoapMessage, SendFailed>>>>,
}

impl Completion {
    fn complete(&self, result: Result<CoapMessage, SendFailed>) {
        let sender = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }
}

impl<Endpoint> ResponseCallback<Endpoint> for Completion {
    fn on_response(&self, _peer: &Endpoint, response: CoapMessage) {
        self.complete(Ok(response));
    }

    fn on_misc_error(&self, error: SendFailed) {
        self.complete(Err(error));
    }
}

#[async_trait]
impl<Endpoint: EndpointAddr> PacketHandler<Endpoint> for ProtocolEngine<Endpoint> {
    async fn handle(&self, decoded: Result<CoapMessage, MessageError>, peer: Endpoint) {
        ProtocolEngine::handle(self, decoded, peer).await;
    }
}

/// Engine configuration paired with the application handler, turned into a running engine
/// once the transport's MTU is known.
pub struct EngineBuilder<Handler> {
    config: ProtocolConfig,
    handler: Handler,
}

impl<Handler> EngineBuilder<Handler> {
    pub fn config(mut self, config: ProtocolConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl<Endpoint, Handler> IntoHandler<ProtocolEngine<Endpoint>, Endpoint>
    for EngineBuilder<Handler>
where
    Endpoint: EndpointAddr,
    Handler: RequestHandler<Endpoint>,
{
    async fn into_handler(
        self,
        mtu: Option<u32>,
        outbox: Outbox<Endpoint>,
    ) -> ProtocolEngine<Endpoint> {
        ProtocolEngine::new(self.config.for_mtu(mtu), self.handler, outbox).await
    }
}

#[async_trait]
impl<Endpoint: EndpointAddr> IntoHandler<ProtocolEngine<Endpoint>, Endpoint> for Router<Endpoint> {
    async fn into_handler(
        self,
        mtu: Option<u32>,
        outbox: Outbox<Endpoint>,
    ) -> ProtocolEngine<Endpoint> {
        ProtocolEngine::new(ProtocolConfig::default().for_mtu(mtu), self, outbox).await
    }
}
