use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time;

use super::*;
use crate::app::CoapResponse;
use crate::codec::decode;
use crate::message::block::BlockValue;
use crate::message::{RequestMethod, Token};
use crate::observe::{ObservableResource, Observers, Representation};

#[derive(Default, Debug, Clone, PartialEq, Eq, Hash)]
struct TestEndpoint(i32);

type Sent = UnboundedReceiver<(CoapMessage, TestEndpoint)>;

async fn start(
    config: ProtocolConfig,
    handler: impl RequestHandler<TestEndpoint>,
) -> (ProtocolEngine<TestEndpoint>, Sent) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = ProtocolEngine::new(config, handler, Outbox::new(tx)).await;
    (engine, rx)
}

fn drain(sent: &mut Sent) -> Vec<CoapMessage> {
    let mut messages = Vec::new();
    while let Ok((message, _)) = sent.try_recv() {
        messages.push(message);
    }
    messages
}

fn request(method: RequestMethod, path: &str, message_id: u16, token: &[u8]) -> CoapMessage {
    let mut request = CoapMessage::new_request(MessageType::Confirmable, method);
    request.set_message_id(message_id);
    request.set_token(Token::new(token).unwrap()).unwrap();
    request.set_uri_path(path).unwrap();
    request
}

fn hello_router(calls: Arc<AtomicUsize>) -> Router<TestEndpoint> {
    Router::new()
        .get("/hello", move |request: CoapRequest<TestEndpoint>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let mut response = request.new_response();
                response.set_payload("world").map_err(CoapError::internal)?;
                Ok::<_, CoapError>(response)
            }
        })
        .post("/upload", |request: CoapRequest<TestEndpoint>| async move {
            let mut response = request.new_response();
            response
                .set_payload(request.payload().to_vec())
                .map_err(CoapError::internal)?;
            Ok::<_, CoapError>(response)
        })
        .get("/big", |request: CoapRequest<TestEndpoint>| async move {
            let mut response = request.new_response();
            response
                .set_payload((0..100u8).collect::<Vec<_>>())
                .map_err(CoapError::internal)?;
            Ok::<_, CoapError>(response)
        })
        .get("/broken", |_request: CoapRequest<TestEndpoint>| async move {
            Err::<CoapResponse, _>(CoapError::bad_request("nope"))
        })
}

async fn hello_engine() -> (ProtocolEngine<TestEndpoint>, Sent, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let (engine, sent) = start(ProtocolConfig::default(), hello_router(calls.clone())).await;
    (engine, sent, calls)
}

#[tokio::test(start_paused = true)]
async fn test_piggybacked_response() {
    let (engine, mut sent, calls) = hello_engine().await;
    let peer = TestEndpoint(1);
    engine
        .handle(Ok(request(RequestMethod::Get, "hello", 0x10, &[1])), peer.clone())
        .await;

    let sent = drain(&mut sent);
    assert_eq!(sent.len(), 1);
    let response = &sent[0];
    assert_eq!(response.message_type(), MessageType::Acknowledgement);
    assert_eq!(response.message_id(), 0x10);
    assert_eq!(response.token().as_bytes(), &[1]);
    assert_eq!(response.status(), Some(ResponseStatus::Content));
    assert_eq!(response.payload(), b"world");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_request_served_once() {
    let (engine, mut sent, calls) = hello_engine().await;
    let peer = TestEndpoint(1);
    for _ in 0..2 {
        engine
            .handle(Ok(request(RequestMethod::Get, "hello", 0x11, &[2])), peer.clone())
            .await;
    }

    let sent = drain(&mut sent);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_routing_errors() {
    let (engine, mut sent, _calls) = hello_engine().await;
    let peer = TestEndpoint(1);
    engine
        .handle(Ok(request(RequestMethod::Get, "missing", 0x12, &[3])), peer.clone())
        .await;
    engine
        .handle(Ok(request(RequestMethod::Delete, "hello", 0x13, &[3])), peer.clone())
        .await;
    engine
        .handle(Ok(request(RequestMethod::Get, "broken", 0x14, &[3])), peer.clone())
        .await;

    let sent = drain(&mut sent);
    let statuses: Vec<_> = sent.iter().map(CoapMessage::status).collect();
    assert_eq!(
        statuses,
        vec![
            Some(ResponseStatus::NotFound),
            Some(ResponseStatus::MethodNotAllowed),
            Some(ResponseStatus::BadRequest),
        ]
    );
    assert_eq!(sent[2].payload(), b"nope");
    assert_eq!(sent[2].content_format(), Some(content_format::TEXT_PLAIN));
}

#[derive(Clone)]
struct Silent;

#[async_trait]
impl RequestHandler<TestEndpoint> for Silent {
    async fn process(&self, _request: CoapRequest<TestEndpoint>, _responder: Responder) {}
}

#[tokio::test(start_paused = true)]
async fn test_dropped_responder_is_internal_error() {
    let (engine, mut sent) = start(ProtocolConfig::default(), Silent).await;
    engine
        .handle(Ok(request(RequestMethod::Get, "any", 0x15, &[4])), TestEndpoint(1))
        .await;

    let sent = drain(&mut sent);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status(), Some(ResponseStatus::InternalServerError));
    assert_eq!(sent[0].message_id(), 0x15);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_datagrams() {
    let (engine, mut sent, calls) = hello_engine().await;
    let peer = TestEndpoint(1);

    // CON GET carrying the unrecognized critical option 9.
    engine
        .handle(decode(&[0x41, 0x01, 0x00, 0x20, 0x07, 0x90]), peer.clone())
        .await;
    let replies = drain(&mut sent);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].message_type(), MessageType::Acknowledgement);
    assert_eq!(replies[0].status(), Some(ResponseStatus::BadOption));
    assert_eq!(replies[0].message_id(), 0x20);
    assert_eq!(replies[0].token().as_bytes(), &[7]);

    // Empty NON is a format error with a usable message ID.
    engine.handle(decode(&[0x50, 0x00, 0x00, 0x05]), peer.clone()).await;
    assert_eq!(drain(&mut sent), vec![CoapMessage::reset(5)]);

    engine.handle(decode(&[0x40, 0x01]), peer.clone()).await;
    assert!(drain(&mut sent).is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_request_typed_as_reply_not_served() {
    let (engine, mut sent, calls) = hello_engine().await;
    let peer = TestEndpoint(1);
    let types = [(MessageType::Acknowledgement, 0x22), (MessageType::Reset, 0x23)];
    for (message_type, message_id) in types {
        let mut bogus = request(RequestMethod::Get, "hello", message_id, &[6]);
        bogus.set_message_type(message_type);
        engine.handle(Ok(bogus), peer.clone()).await;
    }

    time::sleep(Duration::from_secs(5)).await;
    assert!(drain(&mut sent).is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_block1_upload_reassembled() {
    let (engine, mut sent, _calls) = hello_engine().await;
    let peer = TestEndpoint(1);
    let body: Vec<u8> = (0..40u8).collect();

    for (num, chunk) in body.chunks(16).enumerate() {
        let more = (num + 1) * 16 < body.len();
        let mut block = request(RequestMethod::Post, "upload", 0x30 + num as u16, &[4]);
        block
            .set_block1(BlockValue::new(num as u32, more, 0).unwrap())
            .unwrap();
        block.set_payload(chunk.to_vec()).unwrap();
        engine.handle(Ok(block), peer.clone()).await;

        let replies = drain(&mut sent);
        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        assert_eq!(reply.message_id(), 0x30 + num as u16);
        if more {
            assert_eq!(reply.status(), Some(ResponseStatus::Continue));
            assert_eq!(
                reply.block1(),
                Some(BlockValue::new(num as u32, true, 0).unwrap())
            );
        } else {
            assert_eq!(reply.status(), Some(ResponseStatus::Created));
            assert_eq!(reply.payload(), body.as_slice());
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_block1_out_of_order() {
    let (engine, mut sent, _calls) = hello_engine().await;
    let mut block = request(RequestMethod::Post, "upload", 0x40, &[8]);
    block.set_block1(BlockValue::new(1, true, 0).unwrap()).unwrap();
    block.set_payload(vec![0; 16]).unwrap();
    engine.handle(Ok(block), TestEndpoint(1)).await;

    let replies = drain(&mut sent);
    assert_eq!(replies.len(), 1);
    assert_eq!(
        replies[0].status(),
        Some(ResponseStatus::RequestEntityIncomplete)
    );
}

#[tokio::test(start_paused = true)]
async fn test_block2_download() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = ProtocolConfig::default().max_block_size_exponent(1);
    let (engine, mut sent) = start(config, hello_router(calls)).await;
    let peer = TestEndpoint(1);

    engine
        .handle(Ok(request(RequestMethod::Get, "big", 0x50, &[6])), peer.clone())
        .await;
    let first = drain(&mut sent).remove(0);
    assert_eq!(first.block2(), Some(BlockValue::new(0, true, 1).unwrap()));
    assert_eq!(first.size2(), Some(100));
    assert_eq!(first.payload(), &(0..32u8).collect::<Vec<_>>()[..]);

    let mut last = request(RequestMethod::Get, "big", 0x51, &[6]);
    last.set_block2(BlockValue::new(3, false, 1).unwrap()).unwrap();
    engine.handle(Ok(last.clone()), peer.clone()).await;
    let reply = drain(&mut sent).remove(0);
    assert_eq!(reply.status(), Some(ResponseStatus::Content));
    assert_eq!(reply.block2(), Some(BlockValue::new(3, false, 1).unwrap()));
    assert_eq!(reply.payload(), &[96, 97, 98, 99]);

    // The transfer is over once the final block went out.
    last.set_message_id(0x52);
    engine.handle(Ok(last), peer.clone()).await;
    let reply = drain(&mut sent).remove(0);
    assert_eq!(reply.status(), Some(ResponseStatus::PreconditionFailed));
}

struct Lamp {
    observers: Observers,
    on: Arc<AtomicBool>,
}

#[async_trait]
impl ObservableResource for Lamp {
    fn observers(&self) -> &Observers {
        &self.observers
    }

    async fn representation(&self, _accept: Option<u16>) -> Result<Representation, CoapError> {
        let on = self.on.load(Ordering::SeqCst);
        Ok(Representation::new(if on { "on" } else { "off" })
            .content_format(content_format::TEXT_PLAIN)
            .etag(vec![u8::from(on)]))
    }
}

async fn lamp_engine() -> (ProtocolEngine<TestEndpoint>, Sent, Observers, Arc<AtomicBool>) {
    let observers = Observers::new();
    let on = Arc::new(AtomicBool::new(false));
    let router = Router::new().observable(
        "/lamp",
        Lamp {
            observers: observers.clone(),
            on: on.clone(),
        },
    );
    let (engine, sent) = start(ProtocolConfig::default(), router).await;
    (engine, sent, observers, on)
}

fn observe_lamp(message_id: u16, etag: Vec<u8>) -> CoapMessage {
    let mut request = request(RequestMethod::Get, "lamp", message_id, &[5]);
    request.set_observe(u24::from(0u8)).unwrap();
    request.add_etag(etag).unwrap();
    request
}

#[tokio::test(start_paused = true)]
async fn test_notification_revalidates_matching_etag() {
    let (engine, mut sent, observers, on) = lamp_engine().await;
    let peer = TestEndpoint(1);

    // The client already holds the "on" representation.
    engine.handle(Ok(observe_lamp(0x60, vec![1])), peer.clone()).await;
    let registered = drain(&mut sent).remove(0);
    assert_eq!(registered.status(), Some(ResponseStatus::Content));
    assert_eq!(registered.payload(), b"off");
    let sequence = registered.observe().unwrap();
    assert_eq!(engine.observe_manager().observation_count().await, 1);

    on.store(true, Ordering::SeqCst);
    observers.notify_change().await;
    let (notification, to) = sent.recv().await.unwrap();
    assert_eq!(to, peer);
    assert_eq!(notification.message_type(), MessageType::NonConfirmable);
    assert_eq!(notification.status(), Some(ResponseStatus::Valid));
    assert!(notification.payload().is_empty());
    assert_eq!(notification.observe(), Some(sequence.next()));
    assert_eq!(notification.etags(), vec![vec![1]]);
    assert_eq!(notification.token().as_bytes(), &[5]);
}

#[tokio::test(start_paused = true)]
async fn test_reset_notification_cancels_observation() {
    let (engine, mut sent, observers, _on) = lamp_engine().await;
    let peer = TestEndpoint(1);
    engine.handle(Ok(observe_lamp(0x61, vec![9])), peer.clone()).await;
    drain(&mut sent);

    observers.notify_change().await;
    let (notification, _) = sent.recv().await.unwrap();
    assert_eq!(notification.status(), Some(ResponseStatus::Content));
    // Let the pump record the message ID it used.
    time::sleep(Duration::from_millis(10)).await;

    engine
        .handle(Ok(CoapMessage::reset(notification.message_id())), peer)
        .await;
    assert_eq!(engine.observe_manager().observation_count().await, 0);
    assert!(drain(&mut sent).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_client_request_answered() {
    let (engine, mut sent, _calls) = hello_engine().await;
    let client = engine.clone();
    let pending = tokio::spawn(async move {
        let request = CoapMessage::new_request(MessageType::Confirmable, RequestMethod::Get);
        client.request(request, TestEndpoint(2)).await
    });

    let (outgoing, peer) = sent.recv().await.unwrap();
    assert_eq!(peer, TestEndpoint(2));
    assert_eq!(outgoing.token().len(), 4);
    let mut response = CoapMessage::response_to(&outgoing, ResponseStatus::Content);
    response.set_payload(b"42".to_vec()).unwrap();
    engine.handle(Ok(response), peer).await;

    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.payload(), b"42");
    assert_eq!(engine.open_conversations().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_client_request_times_out() {
    let (engine, mut sent, _calls) = hello_engine().await;
    let request = CoapMessage::new_request(MessageType::Confirmable, RequestMethod::Get);
    let result = engine.request(request, TestEndpoint(3)).await;

    assert!(matches!(result, Err(SendFailed::NoReply(5))));
    assert_eq!(drain(&mut sent).len(), 5);
    assert_eq!(engine.open_conversations().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_separate_response_deadline() {
    let (engine, mut sent, _calls) = hello_engine().await;
    let client = engine.clone();
    let pending = tokio::spawn(async move {
        let request = CoapMessage::new_request(MessageType::Confirmable, RequestMethod::Get);
        client.request(request, TestEndpoint(5)).await
    });

    let (outgoing, peer) = sent.recv().await.unwrap();
    engine
        .handle(Ok(CoapMessage::empty_ack(outgoing.message_id())), peer)
        .await;
    time::sleep(Duration::from_secs(200)).await;
    assert_eq!(engine.open_conversations().await, 1);

    time::sleep(Duration::from_secs(60)).await;
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(SendFailed::NoResponse(_))));
    assert_eq!(engine.open_conversations().await, 0);
    assert!(drain(&mut sent).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_separate_response_before_deadline() {
    let (engine, mut sent, _calls) = hello_engine().await;
    let client = engine.clone();
    let pending = tokio::spawn(async move {
        let request = CoapMessage::new_request(MessageType::Confirmable, RequestMethod::Get);
        client.request(request, TestEndpoint(6)).await
    });

    let (outgoing, peer) = sent.recv().await.unwrap();
    engine
        .handle(Ok(CoapMessage::empty_ack(outgoing.message_id())), peer.clone())
        .await;
    time::sleep(Duration::from_secs(30)).await;

    let mut response =
        CoapMessage::new_response(MessageType::Confirmable, ResponseStatus::Content);
    response.set_message_id(0x99);
    response.set_token(outgoing.token().clone()).unwrap();
    response.set_payload(b"late".to_vec()).unwrap();
    engine.handle(Ok(response), peer).await;

    assert_eq!(pending.await.unwrap().unwrap().payload(), b"late");
    time::sleep(Duration::from_secs(300)).await;
    assert_eq!(drain(&mut sent), vec![CoapMessage::empty_ack(0x99)]);
    assert_eq!(engine.open_conversations().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_non_response_reset() {
    let (engine, mut sent, _calls) = hello_engine().await;
    let mut response =
        CoapMessage::new_response(MessageType::NonConfirmable, ResponseStatus::Content);
    response.set_message_id(0x70);
    response.set_token(Token::new(vec![9]).unwrap()).unwrap();
    engine.handle(Ok(response), TestEndpoint(4)).await;

    assert_eq!(drain(&mut sent), vec![CoapMessage::reset(0x70)]);
}
