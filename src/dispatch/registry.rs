//! Static handler/behavior registry and the dispatcher builder.
//!
//! The registry is an explicit map from a request type's `TypeId` to its
//! bound handler and ordered behavior list, constructed once at startup.
//! Chains are composed at build time; dispatch performs a single map lookup
//! and downcast, no discovery or scanning.

use super::behavior::{compose, compose_stream, Behavior, Next, StreamBehavior, StreamNext};
use crate::errors::FlowguardError;
use crate::request::{Handler, Request, StreamHandler, StreamRequest};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

type BoxedEntry = Box<dyn Any + Send + Sync>;
type Sealer = Box<dyn FnOnce(&mut HashMap<TypeId, BoxedEntry>) -> Result<BoxedEntry, FlowguardError>>;

pub(crate) struct UnarySlot<R: Request> {
    pub(crate) chain: Next<R>,
}

pub(crate) struct StreamSlot<R: StreamRequest> {
    pub(crate) chain: StreamNext<R>,
}

struct UnaryRegistration<R: Request> {
    handler: Option<Arc<dyn Handler<R>>>,
    behaviors: Vec<Arc<dyn Behavior<R>>>,
}

struct StreamRegistration<R: StreamRequest> {
    handler: Option<Arc<dyn StreamHandler<R>>>,
    behaviors: Vec<Arc<dyn StreamBehavior<R>>>,
}

/// Builder assembling a [`Dispatcher`](super::Dispatcher).
///
/// Behavior order is the registration order and is never reordered at call
/// time.
#[derive(Default)]
pub struct DispatcherBuilder {
    unary: HashMap<TypeId, BoxedEntry>,
    streaming: HashMap<TypeId, BoxedEntry>,
    unary_sealers: Vec<(TypeId, Sealer)>,
    stream_sealers: Vec<(TypeId, Sealer)>,
}

impl DispatcherBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the handler for a unary request type.
    #[must_use]
    pub fn register_handler<R: Request>(mut self, handler: Arc<dyn Handler<R>>) -> Self {
        self.unary_registration::<R>().handler = Some(handler);
        self
    }

    /// Appends a behavior to a unary request type's chain.
    #[must_use]
    pub fn register_behavior<R: Request>(mut self, behavior: Arc<dyn Behavior<R>>) -> Self {
        self.unary_registration::<R>().behaviors.push(behavior);
        self
    }

    /// Binds the handler for a streaming request type.
    #[must_use]
    pub fn register_stream_handler<R: StreamRequest>(
        mut self,
        handler: Arc<dyn StreamHandler<R>>,
    ) -> Self {
        self.stream_registration::<R>().handler = Some(handler);
        self
    }

    /// Appends a behavior to a streaming request type's chain.
    #[must_use]
    pub fn register_stream_behavior<R: StreamRequest>(
        mut self,
        behavior: Arc<dyn StreamBehavior<R>>,
    ) -> Self {
        self.stream_registration::<R>().behaviors.push(behavior);
        self
    }

    /// Composes all chains and builds the dispatcher.
    ///
    /// # Errors
    ///
    /// Fails if behaviors were registered for a request type that never
    /// received a handler.
    pub fn build(mut self) -> Result<super::Dispatcher, FlowguardError> {
        let mut unary = HashMap::new();
        for (type_id, sealer) in self.unary_sealers.drain(..) {
            unary.insert(type_id, sealer(&mut self.unary)?);
        }

        let mut streaming = HashMap::new();
        for (type_id, sealer) in self.stream_sealers.drain(..) {
            streaming.insert(type_id, sealer(&mut self.streaming)?);
        }

        Ok(super::Dispatcher::from_parts(unary, streaming))
    }

    fn unary_registration<R: Request>(&mut self) -> &mut UnaryRegistration<R> {
        let type_id = TypeId::of::<R>();
        if !self.unary.contains_key(&type_id) {
            self.unary.insert(
                type_id,
                Box::new(UnaryRegistration::<R> {
                    handler: None,
                    behaviors: Vec::new(),
                }),
            );
            self.unary_sealers.push((
                type_id,
                Box::new(move |entries| {
                    let entry = entries
                        .remove(&type_id)
                        .and_then(|e| e.downcast::<UnaryRegistration<R>>().ok())
                        .ok_or_else(|| {
                            FlowguardError::Internal(format!(
                                "registry entry for '{}' has the wrong type",
                                R::name()
                            ))
                        })?;
                    let handler = entry.handler.ok_or_else(|| {
                        FlowguardError::fatal(format!(
                            "behaviors registered for '{}' but no handler was bound",
                            R::name()
                        ))
                    })?;
                    let chain = compose(handler, &entry.behaviors);
                    Ok(Box::new(UnarySlot::<R> { chain }) as BoxedEntry)
                }),
            ));
        }
        let Some(entry) = self
            .unary
            .get_mut(&type_id)
            .and_then(|e| e.downcast_mut::<UnaryRegistration<R>>())
        else {
            unreachable!("entry was just inserted with this exact type")
        };
        entry
    }

    fn stream_registration<R: StreamRequest>(&mut self) -> &mut StreamRegistration<R> {
        let type_id = TypeId::of::<R>();
        if !self.streaming.contains_key(&type_id) {
            self.streaming.insert(
                type_id,
                Box::new(StreamRegistration::<R> {
                    handler: None,
                    behaviors: Vec::new(),
                }),
            );
            self.stream_sealers.push((
                type_id,
                Box::new(move |entries| {
                    let entry = entries
                        .remove(&type_id)
                        .and_then(|e| e.downcast::<StreamRegistration<R>>().ok())
                        .ok_or_else(|| {
                            FlowguardError::Internal(format!(
                                "registry entry for '{}' has the wrong type",
                                R::name()
                            ))
                        })?;
                    let handler = entry.handler.ok_or_else(|| {
                        FlowguardError::fatal(format!(
                            "stream behaviors registered for '{}' but no handler was bound",
                            R::name()
                        ))
                    })?;
                    let chain = compose_stream(handler, &entry.behaviors);
                    Ok(Box::new(StreamSlot::<R> { chain }) as BoxedEntry)
                }),
            ));
        }
        let Some(entry) = self
            .streaming
            .get_mut(&type_id)
            .and_then(|e| e.downcast_mut::<StreamRegistration<R>>())
        else {
            unreachable!("entry was just inserted with this exact type")
        };
        entry
    }
}
