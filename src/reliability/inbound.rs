use std::collections::hash_map::Entry;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::ProtocolConfig;
use crate::message::{CoapMessage, MessageClass, MessageType};
use crate::pipeline::{EndpointAddr, Inbound, Outbound, Outbox, Stage};
use crate::reliability::outbound::SendFailed;
use crate::reliability::MessageKey;
use crate::table::Table;

const PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// Deduplicates the peer's messages and acknowledges its Confirmable ones, either with the
/// response itself (piggy-backed) or, once `empty_ack_delay` passes without one, with an
/// empty ACK.
pub struct InboundReliability<Endpoint> {
    empty_ack_delay: Duration,
    exchange_lifetime: Duration,
    non_lifetime: Duration,
    exchanges: Arc<Table<MessageKey<Endpoint>, InboundExchange>>,
    /// Pending empty ACK deadlines in the order they fall due.
    schedule: Arc<Mutex<VecDeque<(Instant, MessageKey<Endpoint>)>>>,
    outbox: Outbox<Endpoint>,
}

#[derive(Debug, Clone)]
struct InboundExchange {
    state: AckState,
    expires: Instant,
}

#[derive(Debug, Clone)]
enum AckState {
    Scheduled,
    EmptyAckSent,
    Responded(CoapMessage),
    NonConfirmable,
}

enum Duplicate {
    New,
    AckAgain,
    Resend(CoapMessage),
    Ignore,
}

impl<Endpoint: EndpointAddr> InboundReliability<Endpoint> {
    pub fn new(config: &ProtocolConfig, outbox: Outbox<Endpoint>) -> Self {
        let reliability = Self {
            empty_ack_delay: config.empty_ack_delay,
            exchange_lifetime: config.exchange_lifetime,
            non_lifetime: config.non_lifetime,
            exchanges: Arc::new(Table::new()),
            schedule: Arc::new(Mutex::new(VecDeque::new())),
            outbox,
        };
        reliability.spawn_sweep(config.ack_sweep_interval);
        reliability
    }

    /// Background sweep firing due empty ACKs.  It holds the tables weakly and stops once
    /// the owning engine is gone.
    fn spawn_sweep(&self, period: Duration) {
        let exchanges = Arc::downgrade(&self.exchanges);
        let schedule = Arc::downgrade(&self.schedule);
        let outbox = self.outbox.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut next_purge = Instant::now() + PURGE_INTERVAL;
            loop {
                ticker.tick().await;
                let (exchanges, schedule) = match (Weak::upgrade(&exchanges), Weak::upgrade(&schedule)) {
                    (Some(exchanges), Some(schedule)) => (exchanges, schedule),
                    _ => break,
                };
                let now = Instant::now();
                fire_due_acks(&exchanges, &schedule, &outbox, now).await;
                if now >= next_purge {
                    exchanges.retain(|_, exchange| exchange.expires > now).await;
                    next_purge = now + PURGE_INTERVAL;
                }
            }
        });
    }

    /// Records a message that needs no scheduled ACK, returning whether it was new.
    async fn remember(&self, key: MessageKey<Endpoint>, state: AckState, lifetime: Duration) -> bool {
        let now = Instant::now();
        let exchange = InboundExchange {
            state,
            expires: now + lifetime,
        };
        self.exchanges
            .modify(|exchanges| match exchanges.entry(key) {
                Entry::Occupied(mut occupied) => {
                    if occupied.get().expires > now {
                        return false;
                    }
                    occupied.insert(exchange);
                    true
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(exchange);
                    true
                }
            })
            .await
    }

    async fn accept_request(&self, key: MessageKey<Endpoint>) -> Duplicate {
        let now = Instant::now();
        let lifetime = self.exchange_lifetime;
        let duplicate = self
            .exchanges
            .modify(|exchanges| {
                if let Some(existing) = exchanges.get_mut(&key) {
                    if existing.expires > now {
                        return match &existing.state {
                            AckState::Scheduled | AckState::EmptyAckSent => {
                                existing.state = AckState::EmptyAckSent;
                                Duplicate::AckAgain
                            }
                            AckState::Responded(response) => Duplicate::Resend(response.clone()),
                            AckState::NonConfirmable => Duplicate::Ignore,
                        };
                    }
                }
                exchanges.insert(
                    key.clone(),
                    InboundExchange {
                        state: AckState::Scheduled,
                        expires: now + lifetime,
                    },
                );
                Duplicate::New
            })
            .await;
        if let Duplicate::New = duplicate {
            self.schedule
                .lock()
                .await
                .push_back((now + self.empty_ack_delay, key));
        }
        duplicate
    }
}

async fn fire_due_acks<Endpoint: EndpointAddr>(
    exchanges: &Table<MessageKey<Endpoint>, InboundExchange>,
    schedule: &Mutex<VecDeque<(Instant, MessageKey<Endpoint>)>>,
    outbox: &Outbox<Endpoint>,
    now: Instant,
) {
    let due: Vec<_> = {
        let mut schedule = schedule.lock().await;
        let mut due = Vec::new();
        while schedule.front().map_or(false, |(deadline, _)| *deadline <= now) {
            if let Some((_, key)) = schedule.pop_front() {
                due.push(key);
            }
        }
        due
    };

    for key in due {
        let fire = exchanges
            .update(&key, |exchange| match exchange.state {
                AckState::Scheduled => {
                    exchange.state = AckState::EmptyAckSent;
                    true
                }
                _ => false,
            })
            .await
            .unwrap_or(false);
        if fire {
            debug!(
                "No response within the ACK delay, sending empty ACK for mid={} to {:?}",
                key.message_id, key.peer
            );
            outbox.send_control(CoapMessage::empty_ack(key.message_id), key.peer);
        }
    }
}

#[async_trait]
impl<Endpoint: EndpointAddr> Stage<Endpoint> for InboundReliability<Endpoint> {
    async fn handle_inbound(&self, message: &mut CoapMessage, peer: &Endpoint) -> Inbound {
        let message_id = message.message_id();
        let key = MessageKey::new(peer.clone(), message_id);
        match (message.message_type(), message.code()) {
            (MessageType::Acknowledgement | MessageType::Reset, _) => Inbound::Forward,
            (MessageType::Confirmable, MessageClass::Empty) => {
                debug!("Ping from {peer:?}, answering with RST");
                self.outbox
                    .send_control(CoapMessage::reset(message_id), peer.clone());
                Inbound::Consume
            }
            (MessageType::Confirmable, MessageClass::Reserved(code)) => {
                warn!("Rejecting reserved code {code:#04x} from {peer:?}");
                self.outbox
                    .send_control(CoapMessage::reset(message_id), peer.clone());
                Inbound::Consume
            }
            (MessageType::Confirmable, MessageClass::Response(_)) => {
                let lifetime = self.exchange_lifetime;
                let new = self.remember(key, AckState::EmptyAckSent, lifetime).await;
                self.outbox
                    .send_control(CoapMessage::empty_ack(message_id), peer.clone());
                if new {
                    Inbound::Forward
                } else {
                    debug!("Duplicate separate response mid={message_id} from {peer:?}");
                    Inbound::Consume
                }
            }
            (MessageType::Confirmable, MessageClass::Request(_)) => {
                match self.accept_request(key).await {
                    Duplicate::New => Inbound::Forward,
                    Duplicate::AckAgain => {
                        debug!("Duplicate request mid={message_id} from {peer:?}, sending empty ACK");
                        self.outbox
                            .send_control(CoapMessage::empty_ack(message_id), peer.clone());
                        Inbound::Consume
                    }
                    Duplicate::Resend(response) => {
                        debug!("Duplicate request mid={message_id} from {peer:?}, repeating response");
                        self.outbox.send_control(response, peer.clone());
                        Inbound::Consume
                    }
                    Duplicate::Ignore => Inbound::Consume,
                }
            }
            (MessageType::NonConfirmable, _) => {
                let lifetime = self.non_lifetime;
                if self.remember(key, AckState::NonConfirmable, lifetime).await {
                    Inbound::Forward
                } else {
                    debug!("Duplicate NON mid={message_id} from {peer:?}");
                    Inbound::Consume
                }
            }
        }
    }

    async fn handle_outbound(
        &self,
        message: &mut CoapMessage,
        peer: &Endpoint,
        _request: Option<&CoapMessage>,
    ) -> Result<Outbound, SendFailed> {
        if message.message_type() != MessageType::Acknowledgement || message.is_empty_message() {
            return Ok(Outbound::Forward);
        }
        let key = MessageKey::new(peer.clone(), message.message_id());
        let piggybacked = self
            .exchanges
            .update(&key, |exchange| match exchange.state {
                AckState::Scheduled => {
                    exchange.state = AckState::Responded(message.clone());
                    true
                }
                _ => false,
            })
            .await
            .unwrap_or(false);
        if !piggybacked {
            debug!(
                "ACK for mid={} to {peer:?} already sent, sending a separate response",
                message.message_id()
            );
            message.set_message_type(MessageType::Confirmable);
        }
        Ok(Outbound::Forward)
    }
}
