//! Per-call request model.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::{CapabilityName, RequestId};

/// Named parameters passed to a capability. Ordering carries no meaning.
pub type Params = Map<String, Value>;

/// Optional string headers attached to a call.
pub type Headers = BTreeMap<String, String>;

/// A single capability invocation as handed to a binding.
///
/// Requests are immutable once built; a binding owns the request until the
/// terminal response for its [`RequestId`] arrives.
#[derive(Clone, Debug, PartialEq)]
pub struct CapabilityRequest {
    id: RequestId,
    capability: CapabilityName,
    params: Params,
    headers: Headers,
    timeout: Option<Duration>,
    streaming: bool,
}

impl CapabilityRequest {
    /// Starts building a request for the named capability.
    #[must_use]
    pub fn builder(capability: CapabilityName) -> CapabilityRequestBuilder {
        CapabilityRequestBuilder {
            id: None,
            capability,
            params: Params::new(),
            headers: Headers::new(),
            timeout: None,
            streaming: false,
        }
    }

    /// Returns the correlation token.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Returns the capability name.
    #[must_use]
    pub fn capability(&self) -> &CapabilityName {
        &self.capability
    }

    /// Returns the named parameters.
    #[must_use]
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Returns the optional headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the call deadline, if any.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns `true` when the caller expects a chunked response.
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Consumes the request, returning its parameters.
    #[must_use]
    pub fn into_params(self) -> Params {
        self.params
    }
}

/// Builder for [`CapabilityRequest`].
#[derive(Debug)]
pub struct CapabilityRequestBuilder {
    id: Option<RequestId>,
    capability: CapabilityName,
    params: Params,
    headers: Headers,
    timeout: Option<Duration>,
    streaming: bool,
}

impl CapabilityRequestBuilder {
    /// Uses an explicit correlation token instead of a random one.
    #[must_use]
    pub fn id(mut self, id: RequestId) -> Self {
        self.id = Some(id);
        self
    }

    /// Adds a single parameter, replacing any previous value for the name.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Replaces the parameter set.
    #[must_use]
    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Replaces the header set.
    #[must_use]
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the call deadline.
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Marks the request as streaming.
    #[must_use]
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Finalises the request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if a zero timeout or an empty header
    /// name was supplied.
    pub fn build(self) -> Result<CapabilityRequest> {
        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(Error::InvalidRequest {
                reason: "timeout must be greater than zero".into(),
            });
        }

        if self.headers.keys().any(|name| name.trim().is_empty()) {
            return Err(Error::InvalidRequest {
                reason: "header names cannot be empty".into(),
            });
        }

        Ok(CapabilityRequest {
            id: self.id.unwrap_or_default(),
            capability: self.capability,
            params: self.params,
            headers: self.headers,
            timeout: self.timeout,
            streaming: self.streaming,
        })
    }
}
