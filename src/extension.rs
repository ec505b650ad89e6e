//! Message extensions
//!
//! An extension rewrites envelopes as they leave or enter the session,
//! typically to attach authentication under the `ext` key. Transforms must
//! tolerate every channel, meta or user. A failing transform is treated as
//! identity at the call site, so a broken extension degrades to a no-op
//! instead of wedging the session.

use crate::error::Result;
use serde_json::{json, Value};

/// A pair of transforms applied to outbound and inbound envelopes.
///
/// Both default to identity, so implementors override only the direction
/// they care about.
pub trait Extension: Send + Sync {
    /// Rewrite an envelope before it is sent
    fn outgoing(&self, message: Value) -> Result<Value> {
        Ok(message)
    }

    /// Rewrite an envelope as it arrives
    fn incoming(&self, message: Value) -> Result<Value> {
        Ok(message)
    }
}

/// Inserts `ext.api` and `ext.token` authentication fields into every
/// outbound envelope.
pub struct AuthExtension {
    api: String,
    token: String,
}

impl AuthExtension {
    pub fn new(api: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api: api.into(),
            token: token.into(),
        }
    }
}

impl Extension for AuthExtension {
    fn outgoing(&self, mut message: Value) -> Result<Value> {
        if let Some(obj) = message.as_object_mut() {
            let ext = obj
                .entry("ext")
                .or_insert_with(|| json!({}));
            if let Some(ext) = ext.as_object_mut() {
                ext.insert("api".to_string(), Value::String(self.api.clone()));
                ext.insert("token".to_string(), Value::String(self.token.clone()));
            }
        }
        Ok(message)
    }
}

/// Boxed transform used by [`FnExtension`]
pub type TransformFn = dyn Fn(Value) -> Result<Value> + Send + Sync;

/// Wraps caller-supplied closures as an extension, for callers who want a
/// record of functions rather than a named type.
#[derive(Default)]
pub struct FnExtension {
    outgoing: Option<Box<TransformFn>>,
    incoming: Option<Box<TransformFn>>,
}

impl FnExtension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outgoing<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.outgoing = Some(Box::new(f));
        self
    }

    pub fn with_incoming<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.incoming = Some(Box::new(f));
        self
    }
}

impl Extension for FnExtension {
    fn outgoing(&self, message: Value) -> Result<Value> {
        match &self.outgoing {
            Some(f) => f(message),
            None => Ok(message),
        }
    }

    fn incoming(&self, message: Value) -> Result<Value> {
        match &self.incoming {
            Some(f) => f(message),
            None => Ok(message),
        }
    }
}
