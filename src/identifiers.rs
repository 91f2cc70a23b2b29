//! Per-peer generators for message IDs and tokens.

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use log::warn;
use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;

use crate::message::{MessageId, Token};
use crate::table::Table;

/// Every identifier in the space is still reserved for this peer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("all {0} identifiers are in use for this peer")]
pub struct IdExhausted(pub &'static str);

/// Hands out message IDs that are not reused towards the same peer until
/// `lifetime` (EXCHANGE_LIFETIME) has passed since they were issued.
pub struct MessageIdFactory<Endpoint> {
    lifetime: Duration,
    peers: Table<Endpoint, IssuedIds>,
}

#[derive(Debug)]
struct IssuedIds {
    next: MessageId,
    in_use: HashSet<MessageId>,
    expiries: VecDeque<(Instant, MessageId)>,
}

impl IssuedIds {
    fn new() -> Self {
        Self {
            next: rand::thread_rng().gen(),
            in_use: HashSet::new(),
            expiries: VecDeque::new(),
        }
    }

    fn retire_expired(&mut self, now: Instant) {
        while let Some((expiry, message_id)) = self.expiries.front().copied() {
            if expiry > now {
                break;
            }
            self.expiries.pop_front();
            self.in_use.remove(&message_id);
        }
    }

    fn issue(&mut self, now: Instant, lifetime: Duration) -> Option<MessageId> {
        self.retire_expired(now);
        if self.in_use.len() > usize::from(MessageId::MAX) {
            return None;
        }
        let mut candidate = self.next;
        while self.in_use.contains(&candidate) {
            candidate = candidate.wrapping_add(1);
        }
        self.next = candidate.wrapping_add(1);
        self.in_use.insert(candidate);
        self.expiries.push_back((now + lifetime, candidate));
        Some(candidate)
    }
}

impl<Endpoint: Debug + Eq + Hash + Clone> MessageIdFactory<Endpoint> {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            peers: Table::new(),
        }
    }

    pub async fn next_id(&self, peer: &Endpoint) -> Result<MessageId, IdExhausted> {
        let now = Instant::now();
        let lifetime = self.lifetime;
        let issued = self
            .peers
            .modify(|peers| {
                peers
                    .entry(peer.clone())
                    .or_insert_with(IssuedIds::new)
                    .issue(now, lifetime)
            })
            .await;
        issued.ok_or_else(|| {
            warn!("Message IDs exhausted for {peer:?}");
            IdExhausted("message ID")
        })
    }

    pub async fn tracked_peers(&self) -> usize {
        self.peers.len().await
    }

    /// Forgets peers whose every issued ID has expired.
    pub async fn purge(&self) {
        let now = Instant::now();
        self.peers
            .retain(|_, issued| {
                issued.retire_expired(now);
                !issued.in_use.is_empty()
            })
            .await;
    }
}

/// Generates random tokens that are unique among the open conversations with a peer.
pub struct TokenFactory<Endpoint> {
    length: usize,
    in_use: Table<Endpoint, HashSet<Token>>,
}

const TOKEN_ATTEMPTS: usize = 64;

impl<Endpoint: Debug + Eq + Hash + Clone> TokenFactory<Endpoint> {
    pub fn new(length: usize) -> Self {
        Self {
            length: length.clamp(1, 8),
            in_use: Table::new(),
        }
    }

    pub async fn next_token(&self, peer: &Endpoint) -> Result<Token, IdExhausted> {
        let length = self.length;
        self.in_use
            .modify(|peers| {
                let tokens = peers.entry(peer.clone()).or_default();
                let mut rng = rand::thread_rng();
                for _ in 0..TOKEN_ATTEMPTS {
                    let bytes: Vec<u8> = (0..length).map(|_| rng.gen()).collect();
                    let token = Token::new(bytes).ok()?;
                    if tokens.insert(token.clone()) {
                        return Some(token);
                    }
                }
                None
            })
            .await
            .ok_or(IdExhausted("token"))
    }

    /// Marks a token as in use, for requests that arrive with a caller chosen token.
    pub async fn reserve(&self, peer: &Endpoint, token: Token) -> bool {
        self.in_use
            .modify(|peers| peers.entry(peer.clone()).or_default().insert(token))
            .await
    }

    pub async fn release(&self, peer: &Endpoint, token: &Token) {
        self.in_use
            .modify(|peers| {
                if let Some(tokens) = peers.get_mut(peer) {
                    tokens.remove(token);
                    if tokens.is_empty() {
                        peers.remove(peer);
                    }
                }
            })
            .await;
    }
}
