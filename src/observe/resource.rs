use async_trait::async_trait;

use crate::app::CoapError;
use crate::message::option::MAX_AGE_DEFAULT;
use crate::message::{CoapMessage, InvalidMessage};
use crate::observe::observers::Observers;

/// One serialized state of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Representation {
    pub content_format: Option<u16>,
    pub payload: Vec<u8>,
    pub etag: Option<Vec<u8>>,
    pub max_age: Option<u32>,
}

impl Representation {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn content_format(mut self, content_format: u16) -> Self {
        self.content_format = Some(content_format);
        self
    }

    pub fn etag(mut self, etag: impl Into<Vec<u8>>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn max_age(mut self, seconds: u32) -> Self {
        self.max_age = Some(seconds);
        self
    }

    /// True when any of the `etags` a client already holds names this representation.
    pub fn matches_any(&self, etags: &[Vec<u8>]) -> bool {
        self.etag
            .as_ref()
            .map_or(false, |etag| etags.iter().any(|candidate| candidate == etag))
    }

    /// Writes the full representation into `response`.
    pub fn apply_to(&self, response: &mut CoapMessage) -> Result<(), InvalidMessage> {
        self.apply_validators(response)?;
        if let Some(content_format) = self.content_format {
            response.set_content_format(content_format)?;
        }
        response.set_payload(self.payload.clone())
    }

    /// Writes only ETag and Max-Age, as a 2.03 Valid response carries them.
    pub fn apply_validators(&self, response: &mut CoapMessage) -> Result<(), InvalidMessage> {
        if let Some(etag) = &self.etag {
            response.add_etag(etag.clone())?;
        }
        match self.max_age {
            Some(MAX_AGE_DEFAULT) | None => Ok(()),
            Some(seconds) => response.set_max_age(seconds),
        }
    }
}

/// A resource whose state changes can be subscribed to with Observe.
///
/// The server renders notifications by asking for a fresh [`Representation`] whenever the
/// resource publishes a change through its [`Observers`].
#[async_trait]
pub trait ObservableResource: Send + Sync + 'static {
    fn observers(&self) -> &Observers;

    /// Current representation in the content format the subscriber asked for with Accept.
    async fn representation(&self, accept: Option<u16>) -> Result<Representation, CoapError>;

    /// Whether notifications are Confirmable unless a change says otherwise.
    fn notifications_confirmable(&self) -> bool {
        false
    }
}
