//! Block-wise transfer (RFC 7959): reassembly of Block1 request bodies and segmentation of
//! large response bodies into Block2 slices.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::time::Instant;

use crate::config::ProtocolConfig;
use crate::message::block::BlockValue;
use crate::message::option::CoapOption;
use crate::message::{CoapMessage, ResponseStatus};
use crate::pipeline::{ConversationKey, EndpointAddr, Inbound, Outbound, Stage};
use crate::reliability::outbound::SendFailed;
use crate::table::Table;

#[derive(Debug)]
struct Upload {
    buffer: Vec<u8>,
    touched: Instant,
}

#[derive(Debug, Clone)]
struct Download {
    /// The original response without payload, Observe or Size2.
    template: CoapMessage,
    payload: Arc<Vec<u8>>,
    touched: Instant,
}

enum UploadOutcome {
    Continue,
    Complete(Vec<u8>),
    Incomplete,
    TooLarge,
}

pub struct Blockwise<Endpoint> {
    max_size_exponent: u8,
    max_request_body: Option<usize>,
    lifetime: Duration,
    uploads: Table<ConversationKey<Endpoint>, Upload>,
    downloads: Table<ConversationKey<Endpoint>, Download>,
}

impl<Endpoint: EndpointAddr> Blockwise<Endpoint> {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            max_size_exponent: config.max_block_size_exponent,
            max_request_body: config.max_request_body,
            lifetime: config.blockwise_lifetime,
            uploads: Table::new(),
            downloads: Table::new(),
        }
    }

    pub async fn pending_transfers(&self) -> usize {
        self.uploads.len().await + self.downloads.len().await
    }

    async fn handle_block1(
        &self,
        request: &mut CoapMessage,
        peer: &Endpoint,
        block: BlockValue,
    ) -> Inbound {
        let key = ConversationKey::new(peer.clone(), request.token().clone());
        let negotiated = block.size_exponent.min(self.max_size_exponent);

        if let (Some(limit), Some(announced)) = (self.max_request_body, request.size1()) {
            if announced as usize > limit {
                self.uploads.remove(&key).await;
                debug!("Rejecting {announced} byte upload from {peer:?}, limit is {limit}");
                return Inbound::Reply(too_large(request, limit, negotiated));
            }
        }

        let size = block.size();
        let length = request.payload().len();
        if length > size || (block.more && length != size) {
            self.uploads.remove(&key).await;
            debug!(
                "Block1 #{} from {peer:?} carries {length} bytes, block size is {size}",
                block.num
            );
            return Inbound::Reply(CoapMessage::response_to(
                request,
                ResponseStatus::BadRequest,
            ));
        }

        let payload = request.take_payload();
        let limit = self.max_request_body;
        let lifetime = self.lifetime;
        let now = Instant::now();
        let outcome = self
            .uploads
            .modify(|uploads| {
                if block.num == 0 {
                    uploads.retain(|_, upload| now.duration_since(upload.touched) < lifetime);
                    uploads.insert(
                        key.clone(),
                        Upload {
                            buffer: Vec::new(),
                            touched: now,
                        },
                    );
                }
                let in_sequence = match uploads.get_mut(&key) {
                    Some(upload) => {
                        let accumulated = upload.buffer.len();
                        if accumulated % size == 0 && accumulated / size == block.num as usize {
                            upload.buffer.extend_from_slice(&payload);
                            upload.touched = now;
                            Some(upload.buffer.len())
                        } else {
                            None
                        }
                    }
                    None => None,
                };
                match in_sequence {
                    None => {
                        uploads.remove(&key);
                        UploadOutcome::Incomplete
                    }
                    Some(total) if limit.map_or(false, |limit| total > limit) => {
                        uploads.remove(&key);
                        UploadOutcome::TooLarge
                    }
                    Some(_) if block.more => UploadOutcome::Continue,
                    Some(_) => match uploads.remove(&key) {
                        Some(upload) => UploadOutcome::Complete(upload.buffer),
                        None => UploadOutcome::Incomplete,
                    },
                }
            })
            .await;

        match outcome {
            UploadOutcome::Continue => {
                let mut reply = CoapMessage::response_to(request, ResponseStatus::Continue);
                let echo = BlockValue {
                    num: block.num,
                    more: true,
                    size_exponent: negotiated,
                };
                if reply.set_block1(echo).is_err() {
                    return Inbound::Reply(CoapMessage::response_to(
                        request,
                        ResponseStatus::InternalServerError,
                    ));
                }
                Inbound::Reply(reply)
            }
            UploadOutcome::Complete(body) => {
                debug!(
                    "Reassembled {} byte request body from {peer:?} token={}",
                    body.len(),
                    request.token()
                );
                match request.set_payload(body) {
                    Ok(()) => Inbound::Forward,
                    Err(_) => Inbound::Reply(CoapMessage::response_to(
                        request,
                        ResponseStatus::BadRequest,
                    )),
                }
            }
            UploadOutcome::Incomplete => {
                debug!("Block1 #{} from {peer:?} out of sequence", block.num);
                Inbound::Reply(CoapMessage::response_to(
                    request,
                    ResponseStatus::RequestEntityIncomplete,
                ))
            }
            UploadOutcome::TooLarge => Inbound::Reply(too_large(
                request,
                limit.unwrap_or_default(),
                negotiated,
            )),
        }
    }

    async fn serve_block2(&self, request: &CoapMessage, peer: &Endpoint, block: BlockValue) -> Inbound {
        let key = ConversationKey::new(peer.clone(), request.token().clone());
        let download = match self.downloads.get(&key).await {
            Some(download) => download,
            None => {
                debug!("Block2 #{} requested by {peer:?} without a transfer", block.num);
                return Inbound::Reply(CoapMessage::response_to(
                    request,
                    ResponseStatus::PreconditionFailed,
                ));
            }
        };

        let size_exponent = block.size_exponent.min(self.max_size_exponent);
        let size = BlockValue::size_for_exponent(size_exponent);
        let num = block.num as usize * block.size() / size;
        let offset = num * size;
        let total = download.payload.len();
        if offset >= total {
            return Inbound::Reply(CoapMessage::response_to(request, ResponseStatus::BadOption));
        }
        let end = (offset + size).min(total);
        let more = end < total;

        let status = download.template.status().unwrap_or(ResponseStatus::Content);
        let mut response = CoapMessage::response_to(request, status);
        for (option, value) in download.template.options() {
            response.insert_decoded_option(option, value.clone());
        }
        let slice = BlockValue {
            num: num as u32,
            more,
            size_exponent,
        };
        let built = response
            .set_block2(slice)
            .and_then(|_| response.set_payload(download.payload[offset..end].to_vec()));
        if built.is_err() {
            return Inbound::Reply(CoapMessage::response_to(
                request,
                ResponseStatus::InternalServerError,
            ));
        }

        if more {
            self.downloads
                .update(&key, |download| download.touched = Instant::now())
                .await;
        } else {
            debug!("Final Block2 slice delivered to {peer:?}");
            self.downloads.remove(&key).await;
        }
        Inbound::Reply(response)
    }
}

fn too_large(request: &CoapMessage, limit: usize, size_exponent: u8) -> CoapMessage {
    let mut reply = CoapMessage::response_to(request, ResponseStatus::RequestEntityTooLarge);
    let preferred = BlockValue {
        num: 0,
        more: false,
        size_exponent,
    };
    let _ = reply.set_block1(preferred);
    if let Ok(limit) = u32::try_from(limit) {
        let _ = reply.set_size1(limit);
    }
    reply
}

#[async_trait]
impl<Endpoint: EndpointAddr> Stage<Endpoint> for Blockwise<Endpoint> {
    async fn handle_inbound(&self, message: &mut CoapMessage, peer: &Endpoint) -> Inbound {
        if !message.is_request() {
            return Inbound::Forward;
        }
        if let Some(block) = message.block1() {
            return self.handle_block1(message, peer, block).await;
        }
        match message.block2() {
            Some(block) if block.num > 0 => self.serve_block2(message, peer, block).await,
            Some(_) => {
                // Restarting from block 0 asks for a fresh representation.
                let key = ConversationKey::new(peer.clone(), message.token().clone());
                self.downloads.remove(&key).await;
                Inbound::Forward
            }
            None => Inbound::Forward,
        }
    }

    async fn handle_outbound(
        &self,
        message: &mut CoapMessage,
        peer: &Endpoint,
        request: Option<&CoapMessage>,
    ) -> Result<Outbound, SendFailed> {
        if !message.is_response() || message.has_option(CoapOption::Block2) {
            return Ok(Outbound::Forward);
        }
        let size_exponent = request
            .and_then(CoapMessage::block2)
            .map_or(self.max_size_exponent, |block| {
                block.size_exponent.min(self.max_size_exponent)
            });
        let size = BlockValue::size_for_exponent(size_exponent);
        if message.payload().len() <= size {
            return Ok(Outbound::Forward);
        }

        let payload = message.take_payload();
        let mut template = message.clone();
        template.remove_option(CoapOption::Observe);

        if let Ok(total) = u32::try_from(payload.len()) {
            message.set_size2(total).map_err(anyhow::Error::from)?;
        }
        let first = BlockValue {
            num: 0,
            more: true,
            size_exponent,
        };
        message.set_block2(first).map_err(anyhow::Error::from)?;
        message
            .set_payload(payload[..size].to_vec())
            .map_err(anyhow::Error::from)?;

        debug!(
            "Splitting {} byte response to {peer:?} into {size} byte blocks",
            payload.len()
        );
        let key = ConversationKey::new(peer.clone(), message.token().clone());
        let now = Instant::now();
        let lifetime = self.lifetime;
        let download = Download {
            template,
            payload: Arc::new(payload),
            touched: now,
        };
        self.downloads
            .modify(|downloads| {
                downloads.retain(|_, d| now.duration_since(d.touched) < lifetime);
                downloads.insert(key, download);
            })
            .await;
        Ok(Outbound::Forward)
    }
}
