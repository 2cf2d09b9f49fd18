//! Inbound call type.

use std::net::SocketAddr;

use serde::de::DeserializeOwned;

use crate::context::CallContext;
use crate::metadata::Metadata;
use crate::status::Status;

/// Outcome of a call: the JSON reply payload or a typed failure.
pub type Reply = Result<serde_json::Value, Status>;

/// One inbound call, decoded from the transport.
///
/// A `Call` moves by value through the chain. Stages read and extend it, then
/// hand it to the next stage; nothing keeps it once the call completes.
pub struct Call {
    pub(crate) method: String,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) metadata: Option<Metadata>,
    pub(crate) context: CallContext,
    pub(crate) payload: serde_json::Value,
    pub(crate) extensions: http::Extensions,
}

impl Call {
    /// A call to `method` (full path, e.g. `/infra.apply.v1.InfraApply/ListInfraApply`)
    /// with no metadata attached.
    pub fn new(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            peer: None,
            metadata: None,
            context: CallContext::new(),
            payload,
            extensions: http::Extensions::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_context(mut self, context: CallContext) -> Self {
        self.context = context;
        self
    }

    pub fn method(&self) -> &str { &self.method }
    pub fn peer(&self) -> Option<SocketAddr> { self.peer }
    pub fn metadata(&self) -> Option<&Metadata> { self.metadata.as_ref() }
    pub fn metadata_mut(&mut self) -> Option<&mut Metadata> { self.metadata.as_mut() }
    pub fn context(&self) -> &CallContext { &self.context }
    pub fn payload(&self) -> &serde_json::Value { &self.payload }
    pub fn extensions(&self) -> &http::Extensions { &self.extensions }
    pub fn extensions_mut(&mut self) -> &mut http::Extensions { &mut self.extensions }

    /// Swaps in an extended context, returning the previous one.
    pub fn replace_context(&mut self, context: CallContext) -> CallContext {
        std::mem::replace(&mut self.context, context)
    }

    /// Drops the metadata. Only useful for exercising fail-closed paths.
    pub fn take_metadata(&mut self) -> Option<Metadata> {
        self.metadata.take()
    }

    /// Decodes the payload into a typed request.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Status> {
        T::deserialize(&self.payload)
            .map_err(|e| Status::invalid_argument(format!("malformed request: {e}")))
    }
}
