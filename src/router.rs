//! After JSON RPC messages have been decoded, those that represent method calls or notifications
//! need to be routed to the corresponding handler descriptor.  The registry of descriptors lives
//! in the [`Router`] type in this module.
//!
//! The router is a multimap from method name to descriptor.  Requests require exactly one
//! matching descriptor; registering a second request handler for the same method fails fast at
//! registration time rather than producing ambiguous dispatch later.  Notifications fan out to
//! every matching descriptor in registration order.
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use crate::handler::{self, Handler};
use crate::types::Method;
use crate::{JsonRpcError, Result};

/// Whether a descriptor services method calls or notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Invoked with an id; produces exactly one reply.
    Request,
    /// Fire-and-forget; never produces a reply.
    Notification,
}

/// Registration record describing a method, its kind, its scheduling group, and the handler that
/// services it.
///
/// The params/result marshalling lives inside the handler itself (see [`handler::typed`]), built
/// at registration time, so dispatch never does any reflection.
pub struct HandlerDescriptor {
    pub(crate) method: Method,
    pub(crate) kind: HandlerKind,
    pub(crate) serial_group: Option<String>,
    pub(crate) handler: Arc<dyn Handler>,
}

impl HandlerDescriptor {
    /// Describe a request handler for `method`.
    pub fn request(method: impl Into<Method>, handler: impl Handler) -> Self {
        Self {
            method: method.into(),
            kind: HandlerKind::Request,
            serial_group: None,
            handler: Arc::new(handler),
        }
    }

    /// Describe a notification handler for `method`.
    pub fn notification(method: impl Into<Method>, handler: impl Handler) -> Self {
        Self {
            method: method.into(),
            kind: HandlerKind::Notification,
            serial_group: None,
            handler: Arc::new(handler),
        }
    }

    /// Put this descriptor in a serial group.
    ///
    /// Invocations of descriptors sharing a group run strictly in the order their messages came
    /// off the wire; an invocation starts only once every predecessor in the group has completed
    /// or been cancelled.
    pub fn with_serial_group(mut self, group: impl Into<String>) -> Self {
        self.serial_group = Some(group.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    pub fn serial_group(&self) -> Option<&str> {
        self.serial_group.as_deref()
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("method", &self.method)
            .field("kind", &self.kind)
            .field("serial_group", &self.serial_group)
            .finish_non_exhaustive()
    }
}

struct RegisteredEntry {
    registration_id: u64,
    descriptor: Arc<HandlerDescriptor>,
}

#[derive(Default)]
struct RouterInner {
    /// Descriptors per method, in registration order
    by_method: HashMap<Method, Vec<RegisteredEntry>>,
    next_registration_id: u64,
}

/// Registry mapping method names to handler descriptors.
///
/// Loosely inspired by the `axum` router, but much simpler: it only routes on the JSON-RPC
/// method name, and what it routes are complete, already-decoded JSON RPC messages.
///
/// Registration is thread-safe and visible to the next dispatch after it returns; dispatch is
/// read-mostly behind an `RwLock`.
#[derive(Clone, Default)]
pub struct Router {
    inner: Arc<RwLock<RouterInner>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, returning a scoped [`Registration`] guard.
    ///
    /// Dropping the guard removes the descriptor; call [`Registration::forever`] to keep the
    /// registration for the life of the router.
    ///
    /// Registering a second *request* descriptor for a method that already has one is a
    /// configuration error and fails immediately.  Notification descriptors stack.
    pub fn register(&self, descriptor: HandlerDescriptor) -> Result<Registration> {
        let descriptor = Arc::new(descriptor);
        let mut inner = self.inner.write().unwrap();

        let entries = inner.by_method.entry(descriptor.method.clone()).or_default();
        if descriptor.kind == HandlerKind::Request
            && entries.iter().any(|e| e.descriptor.kind == HandlerKind::Request)
        {
            return Err(JsonRpcError::DuplicateRegistration {
                method: descriptor.method.clone(),
            });
        }

        inner.next_registration_id += 1;
        let registration_id = inner.next_registration_id;
        let method = descriptor.method.clone();

        // Reborrow after the id bump to appease the borrow checker
        inner.by_method.entry(method.clone()).or_default().push(RegisteredEntry {
            registration_id,
            descriptor,
        });

        Ok(Registration {
            inner: Arc::downgrade(&self.inner),
            method,
            registration_id,
        })
    }

    /// Convenience: register a typed request handler.
    pub fn register_request<P, F, Fut, Res>(&self, method: impl Into<Method>, f: F) -> Result<Registration>
    where
        P: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(P, tokio_util::sync::CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Res> + Send + 'static,
        Res: handler::IntoResponse,
    {
        self.register(HandlerDescriptor::request(method, handler::typed(f)))
    }

    /// Convenience: register a typed notification handler.
    pub fn register_notification<P, F, Fut, Res>(
        &self,
        method: impl Into<Method>,
        f: F,
    ) -> Result<Registration>
    where
        P: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(P, tokio_util::sync::CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Res> + Send + 'static,
        Res: handler::IntoResponse,
    {
        self.register(HandlerDescriptor::notification(method, handler::typed(f)))
    }

    /// Look up the single request descriptor for a method.
    pub(crate) fn lookup_request(&self, method: &Method) -> Option<Arc<HandlerDescriptor>> {
        let inner = self.inner.read().unwrap();
        inner.by_method.get(method).and_then(|entries| {
            entries
                .iter()
                .find(|e| e.descriptor.kind == HandlerKind::Request)
                .map(|e| e.descriptor.clone())
        })
    }

    /// Look up all notification descriptors for a method, in registration order.
    pub(crate) fn lookup_notifications(&self, method: &Method) -> Vec<Arc<HandlerDescriptor>> {
        let inner = self.inner.read().unwrap();
        inner
            .by_method
            .get(method)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.descriptor.kind == HandlerKind::Notification)
                    .map(|e| e.descriptor.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Scoped handle to a registered descriptor.  Dropping it removes the descriptor from the router.
#[must_use = "dropping a Registration immediately unregisters the handler"]
#[derive(Debug)]
pub struct Registration {
    inner: Weak<RwLock<RouterInner>>,
    method: Method,
    registration_id: u64,
}

impl Registration {
    /// Keep this registration for the life of the router instead of tying it to this guard.
    pub fn forever(mut self) {
        self.inner = Weak::new();
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.write().unwrap();
            if let Some(entries) = inner.by_method.get_mut(&self.method) {
                entries.retain(|e| e.registration_id != self.registration_id);
                if entries.is_empty() {
                    inner.by_method.remove(&self.method);
                }
            }
        }
    }
}
