//! Executable capabilities exposed to the local binding.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use agent_primitives::Params;
use futures::Stream;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use super::signature::Signature;

/// Result alias for callable bodies.
pub type CallResult<T> = Result<T, CallError>;

/// Items produced by a synchronous generator.
pub type ValueIter = Box<dyn Iterator<Item = CallResult<Value>> + Send>;

/// Items produced by an asynchronous generator.
pub type ValueStream = BoxStream<'static, CallResult<Value>>;

/// Failure raised by a callable body.
#[derive(Debug, Error)]
pub enum CallError {
    /// The body reported a failure.
    #[error("{message}")]
    Failed {
        /// Human-readable description.
        message: String,
    },

    /// An argument could not be read as the expected type.
    #[error("argument `{name}` is invalid: {reason}")]
    Argument {
        /// Parameter name.
        name: String,
        /// Why the value was rejected.
        reason: String,
    },
}

impl CallError {
    /// Convenience constructor for body failures.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Arguments bound to a callable's signature.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments(Params);

impl Arguments {
    /// Wraps already-bound parameters.
    #[must_use]
    pub fn new(params: Params) -> Self {
        Self(params)
    }

    /// Deserializes the named argument.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Argument`] when the argument is missing or has the
    /// wrong shape.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> CallResult<T> {
        let value = self.0.get(name).ok_or_else(|| CallError::Argument {
            name: name.to_owned(),
            reason: "missing".into(),
        })?;
        serde_json::from_value(value.clone()).map_err(|err| CallError::Argument {
            name: name.to_owned(),
            reason: err.to_string(),
        })
    }

    /// Returns the raw value of the named argument.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Returns every bound argument.
    #[must_use]
    pub fn as_params(&self) -> &Params {
        &self.0
    }

    /// Consumes the arguments.
    #[must_use]
    pub fn into_params(self) -> Params {
        self.0
    }
}

type SyncFn = dyn Fn(Arguments) -> CallResult<Value> + Send + Sync;
type SyncGenFn = dyn Fn(Arguments) -> CallResult<ValueIter> + Send + Sync;
type AsyncFn = dyn Fn(Arguments) -> BoxFuture<'static, CallResult<Value>> + Send + Sync;
type AsyncGenFn = dyn Fn(Arguments) -> ValueStream + Send + Sync;

/// The execution shape of a callable, fixed at registration time.
#[derive(Clone)]
pub(crate) enum Shape {
    Plain(Arc<SyncFn>),
    Generator(Arc<SyncGenFn>),
    Awaitable(Arc<AsyncFn>),
    AsyncGenerator(Arc<AsyncGenFn>),
}

/// Public tag describing a callable's execution shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    /// Returns one value; runs on the blocking pool.
    Plain,
    /// Yields values from an iterator; runs on the blocking pool.
    Generator,
    /// Returns one value from a future.
    Awaitable,
    /// Yields values from a stream.
    AsyncGenerator,
}

impl ShapeKind {
    /// Returns `true` for shapes that yield many values.
    #[must_use]
    pub const fn is_generator(self) -> bool {
        matches!(self, Self::Generator | Self::AsyncGenerator)
    }
}

/// A named unit of work with a declared signature.
#[derive(Clone)]
pub struct Callable {
    signature: Signature,
    shape: Shape,
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("signature", &self.signature)
            .field("shape", &self.kind())
            .finish()
    }
}

impl Callable {
    /// A blocking function returning one value.
    #[must_use]
    pub fn plain<F>(signature: Signature, body: F) -> Self
    where
        F: Fn(Arguments) -> CallResult<Value> + Send + Sync + 'static,
    {
        Self {
            signature,
            shape: Shape::Plain(Arc::new(body)),
        }
    }

    /// A blocking function returning an iterator of values.
    #[must_use]
    pub fn generator<F, I>(signature: Signature, body: F) -> Self
    where
        F: Fn(Arguments) -> CallResult<I> + Send + Sync + 'static,
        I: IntoIterator<Item = CallResult<Value>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            signature,
            shape: Shape::Generator(Arc::new(move |args| {
                body(args).map(|items| Box::new(items.into_iter()) as ValueIter)
            })),
        }
    }

    /// An async function returning one value.
    #[must_use]
    pub fn awaitable<F, Fut>(signature: Signature, body: F) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult<Value>> + Send + 'static,
    {
        Self {
            signature,
            shape: Shape::Awaitable(Arc::new(move |args| Box::pin(body(args)))),
        }
    }

    /// An async function yielding a stream of values.
    #[must_use]
    pub fn async_generator<F, S>(signature: Signature, body: F) -> Self
    where
        F: Fn(Arguments) -> S + Send + Sync + 'static,
        S: Stream<Item = CallResult<Value>> + Send + 'static,
    {
        Self {
            signature,
            shape: Shape::AsyncGenerator(Arc::new(move |args| Box::pin(body(args)))),
        }
    }

    /// Returns the declared signature.
    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Returns the execution shape.
    #[must_use]
    pub fn kind(&self) -> ShapeKind {
        match &self.shape {
            Shape::Plain(_) => ShapeKind::Plain,
            Shape::Generator(_) => ShapeKind::Generator,
            Shape::Awaitable(_) => ShapeKind::Awaitable,
            Shape::AsyncGenerator(_) => ShapeKind::AsyncGenerator,
        }
    }

    pub(crate) fn shape(&self) -> &Shape {
        &self.shape
    }
}
