use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use tokio::sync::Mutex;
use tokio::time;

use coap_engine::app::{CoapError, CoapRequest, CoapResponse, Router};
use coap_engine::message::option::content_format;
use coap_engine::observe::{ObservableResource, Observers, Representation};
use coap_engine::{CoapServer, FatalServerError, UdpTransport};

#[tokio::main]
async fn main() -> Result<(), FatalServerError> {
    env_logger::init();
    let counter_state = CounterState::default();
    tick_forever(counter_state.clone());

    let server = CoapServer::bind(UdpTransport::new("0.0.0.0:5683")).await?;
    server.serve(build_router(counter_state)).await
}

fn build_router(counter_state: CounterState) -> Router<SocketAddr> {
    let state_for_put = counter_state.clone();
    Router::new()
        // Try `coap-client -s 10 -m get coap://localhost/counter`.  You can also in parallel
        // run `coap-client -m put coap://localhost/counter/inc` to show the values increment
        // in response to user behaviour.
        .observable("/counter", counter_state)
        .put("/counter/inc", move |request| {
            handle_put_counter_inc(request, state_for_put.clone())
        })
}

#[derive(Default, Clone)]
struct CounterState {
    counter: Arc<Mutex<u32>>,
    observers: Observers,
}

#[async_trait]
impl ObservableResource for CounterState {
    fn observers(&self) -> &Observers {
        &self.observers
    }

    async fn representation(&self, _accept: Option<u16>) -> Result<Representation, CoapError> {
        let count = *self.counter.lock().await;
        Ok(Representation::new(format!("{count}\n"))
            .content_format(content_format::TEXT_PLAIN)
            .etag(count.to_be_bytes().to_vec()))
    }
}

fn tick_forever(state: CounterState) {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            *state.counter.lock().await += 1;
            state.observers.notify_change().await;
        }
    });
}

async fn handle_put_counter_inc(
    request: CoapRequest<SocketAddr>,
    state: CounterState,
) -> Result<CoapResponse, CoapError> {
    {
        let mut count = state.counter.lock().await;
        *count += 1;
    }
    info!("Counter bumped by {:?}", request.peer);
    state.observers.notify_change().await;
    Ok(request.new_response())
}
