use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::time::{self, MissedTickBehavior};

use crate::config::TransmissionParameters;
use crate::identifiers::{IdExhausted, MessageIdFactory};
use crate::message::{CoapMessage, MessageClass, MessageId, MessageType, Token};
use crate::pipeline::{EndpointAddr, Inbound, Outbound, Outbox, Stage};
use crate::reliability::MessageKey;
use crate::table::Table;

const MESSAGE_ID_PURGE_INTERVAL: Duration = Duration::from_secs(10);

/// Applies ack timeouts and retry policies to Confirmable messages that are sent through
/// it, and assigns message IDs to every Confirmable and Non-confirmable message.
pub struct OutboundReliability<Endpoint> {
    parameters: TransmissionParameters,
    message_ids: Arc<MessageIdFactory<Endpoint>>,
    exchanges: Arc<Table<MessageKey<Endpoint>, Exchange>>,
    outbox: Outbox<Endpoint>,
    events: UnboundedSender<ExchangeEvent<Endpoint>>,
}

struct Exchange {
    token: Token,

    /// Dropping the exchange drops this sender, which wakes and stops the retransmission
    /// task.
    _cancel: oneshot::Sender<()>,
}

/// Outcome of a Confirmable message, published once per exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeEvent<Endpoint> {
    pub peer: Endpoint,
    pub token: Token,
    pub message_id: MessageId,
    pub kind: ExchangeEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeEventKind {
    Acknowledged,
    Reset,
    TimedOut { transmissions: usize },
}

impl<Endpoint> ExchangeEvent<Endpoint> {
    /// The transport failure this event reports, if any.
    pub fn failure(&self) -> Option<SendFailed> {
        match self.kind {
            ExchangeEventKind::Acknowledged => None,
            ExchangeEventKind::Reset => Some(SendFailed::Reset),
            ExchangeEventKind::TimedOut { transmissions } => {
                Some(SendFailed::NoReply(transmissions))
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum SendFailed {
    #[error("no remote reply after {0} attempts")]
    NoReply(usize),

    #[error("reset message received")]
    Reset,

    #[error("request acknowledged but no response followed within {0:?}")]
    NoResponse(Duration),

    #[error("no message ID available: {0}")]
    NoMessageId(#[from] IdExhausted),

    #[error(transparent)]
    Transmission(#[from] anyhow::Error),
}

impl<Endpoint: EndpointAddr> OutboundReliability<Endpoint> {
    pub fn new(
        parameters: TransmissionParameters,
        message_ids: MessageIdFactory<Endpoint>,
        outbox: Outbox<Endpoint>,
        events: UnboundedSender<ExchangeEvent<Endpoint>>,
    ) -> Self {
        let reliability = Self {
            parameters,
            message_ids: Arc::new(message_ids),
            exchanges: Arc::new(Table::new()),
            outbox,
            events,
        };
        reliability.spawn_message_id_purge();
        reliability
    }

    /// Drops the message ID bookkeeping of peers whose IDs have all expired.  Stops once
    /// the owning engine is gone.
    fn spawn_message_id_purge(&self) {
        let message_ids = Arc::downgrade(&self.message_ids);
        tokio::spawn(async move {
            let mut ticker = time::interval(MESSAGE_ID_PURGE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match Weak::upgrade(&message_ids) {
                    Some(message_ids) => message_ids.purge().await,
                    None => break,
                }
            }
        });
    }

    /// Number of peers that still have message IDs reserved.
    pub async fn tracked_peers(&self) -> usize {
        self.message_ids.tracked_peers().await
    }

    /// Abandons every open exchange carrying `token`, stopping their retransmissions
    /// without publishing an event.
    pub async fn cancel(&self, peer: &Endpoint, token: &Token) {
        self.exchanges
            .retain(|key, exchange| !(key.peer == *peer && exchange.token == *token))
            .await;
    }

    pub async fn open_exchanges(&self) -> usize {
        self.exchanges.len().await
    }

    fn register(&self, message: &CoapMessage, peer: &Endpoint) -> (Exchange, oneshot::Receiver<()>) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let exchange = Exchange {
            token: message.token().clone(),
            _cancel: cancel_tx,
        };
        debug!(
            "Registered exchange mid={} to {peer:?}",
            message.message_id()
        );
        (exchange, cancel_rx)
    }

    /// Long running retransmission loop for one exchange.  Each wake-up re-checks that the
    /// exchange is still open; an ACK or RST removes it, which also resolves `cancelled`.
    fn spawn_retransmission(
        &self,
        message: CoapMessage,
        peer: Endpoint,
        mut cancelled: oneshot::Receiver<()>,
    ) {
        let parameters = self.parameters;
        let exchanges = self.exchanges.clone();
        let outbox = self.outbox.clone();
        let events = self.events.clone();
        let key = MessageKey::new(peer.clone(), message.message_id());
        let mut next_timeout = rand::thread_rng().gen_range(parameters.ack_timeout_range());

        tokio::spawn(async move {
            for attempt in 0..=parameters.max_retransmit() {
                let timeout = next_timeout;
                next_timeout *= 2;
                tokio::select! {
                    _ = &mut cancelled => return,
                    _ = time::sleep(timeout) => {}
                }
                if !exchanges.contains(&key).await {
                    return;
                }
                if attempt == parameters.max_retransmit() {
                    break;
                }
                debug!(
                    "Attempting retransmission #{} of mid={} to {peer:?}",
                    attempt + 1,
                    key.message_id
                );
                if outbox.send(message.clone(), peer.clone()).is_err() {
                    exchanges.remove(&key).await;
                    return;
                }
            }

            if let Some(exchange) = exchanges.remove(&key).await {
                let transmissions = parameters.max_retransmit() + 1;
                warn!(
                    "No reply from {peer:?} for mid={} after {transmissions} transmissions",
                    key.message_id
                );
                let _ = events.send(ExchangeEvent {
                    peer,
                    token: exchange.token,
                    message_id: key.message_id,
                    kind: ExchangeEventKind::TimedOut { transmissions },
                });
            }
        });
    }
}

#[async_trait]
impl<Endpoint: EndpointAddr> Stage<Endpoint> for OutboundReliability<Endpoint> {
    async fn handle_inbound(&self, message: &mut CoapMessage, peer: &Endpoint) -> Inbound {
        let kind = match message.message_type() {
            MessageType::Acknowledgement => ExchangeEventKind::Acknowledged,
            MessageType::Reset => ExchangeEventKind::Reset,
            _ => return Inbound::Forward,
        };
        let message_id = message.message_id();
        if let MessageClass::Request(method) = message.code() {
            debug!("Ignoring {kind:?}-typed {method:?} request mid={message_id} from {peer:?}");
            return Inbound::Consume;
        }
        let key = MessageKey::new(peer.clone(), message_id);
        match self.exchanges.remove(&key).await {
            Some(exchange) => {
                debug!("Exchange mid={message_id} with {peer:?} closed: {kind:?}");
                let _ = self.events.send(ExchangeEvent {
                    peer: peer.clone(),
                    token: exchange.token,
                    message_id,
                    kind,
                });
                if message.is_empty_message() {
                    Inbound::Consume
                } else {
                    Inbound::Forward
                }
            }
            None if kind == ExchangeEventKind::Reset => {
                // May answer a Non-confirmable notification; let the observe layer decide.
                Inbound::Forward
            }
            None => {
                debug!("Got {kind:?} from {peer:?} for unrecognized mid={message_id}");
                Inbound::Consume
            }
        }
    }

    async fn handle_outbound(
        &self,
        message: &mut CoapMessage,
        peer: &Endpoint,
        _request: Option<&CoapMessage>,
    ) -> Result<Outbound, SendFailed> {
        match message.message_type() {
            MessageType::Acknowledgement | MessageType::Reset => return Ok(Outbound::Forward),
            MessageType::NonConfirmable => {
                message.set_message_id(self.message_ids.next_id(peer).await?);
                return Ok(Outbound::Forward);
            }
            MessageType::Confirmable => {}
        }

        message.set_message_id(self.message_ids.next_id(peer).await?);
        let (exchange, cancelled) = self.register(message, peer);
        let key = MessageKey::new(peer.clone(), message.message_id());
        if self.exchanges.insert(key, exchange).await.is_some() {
            warn!("Replaced a live exchange for mid={}", message.message_id());
        }
        self.spawn_retransmission(message.clone(), peer.clone(), cancelled);
        Ok(Outbound::Forward)
    }
}
