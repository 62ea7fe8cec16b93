//! Command dispatch.
//!
//! A [`Dispatcher`] turns one parsed document into exactly one [`Response`].
//! Validation happens in a fixed order:
//!
//! 1. the document is an object
//! 2. `operation` is a non-empty string
//! 3. `args`, if present, is an object (absent means empty)
//! 4. the operation is registered
//! 5. the handler accepts its arguments and succeeds
//!
//! Every failure, including a panicking handler, is returned as an error
//! response. Nothing escapes `dispatch`.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::CommandError;
use crate::wire::{Command, Fields, Response};

/// Result of a handler invocation.
pub type HandlerResult = Result<Fields, CommandError>;

/// A domain operation reachable by name.
///
/// Handlers validate their own arguments. On success the returned fields are
/// merged into an ok response.
pub trait Handler: Send + Sync {
    /// Runs the operation.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandError`] describing rejected arguments or a failed
    /// operation.
    fn call(&self, args: &Fields) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&Fields) -> HandlerResult + Send + Sync,
{
    fn call(&self, args: &Fields) -> HandlerResult {
        self(args)
    }
}

/// Maps operation names to handlers.
#[derive(Default)]
pub struct Registry {
    handlers: BTreeMap<String, Box<dyn Handler>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `operation`, replacing any previous one.
    pub fn register(
        &mut self,
        operation: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> &mut Self {
        let operation = operation.into();
        if self
            .handlers
            .insert(operation.clone(), Box::new(handler))
            .is_some()
        {
            warn!(operation = %operation, "Replaced previously registered handler");
        }
        self
    }

    /// Registered operation names in sorted order.
    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Returns `true` if `operation` has a handler.
    #[must_use]
    pub fn contains(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    /// Number of registered operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no operation is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn get(&self, operation: &str) -> Option<&dyn Handler> {
        self.handlers.get(operation).map(|handler| &**handler)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// Validates documents and routes them to handlers.
#[derive(Debug, Default)]
pub struct Dispatcher {
    registry: Registry,
}

impl Dispatcher {
    /// Creates a dispatcher over `registry`.
    #[must_use]
    pub const fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// The handler registry.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Produces the response for one parsed document.
    #[must_use]
    pub fn dispatch(&self, document: Value) -> Response {
        match Command::from_document(document) {
            Ok(command) => self.execute(&command),
            Err(error) => {
                warn!(error = %error, "Rejected malformed command envelope");
                error.into()
            }
        }
    }

    /// Runs an already validated command.
    #[must_use]
    pub fn execute(&self, command: &Command) -> Response {
        let operation = command.operation();
        let Some(handler) = self.registry.get(operation) else {
            warn!(operation = %operation, "Unknown operation");
            return CommandError::UnknownOperation(operation.to_string()).into();
        };

        debug!(operation = %operation, args = ?command.args(), "Dispatching command");

        match catch_unwind(AssertUnwindSafe(|| handler.call(command.args()))) {
            Ok(Ok(fields)) => Response::ok(fields),
            Ok(Err(error)) => {
                warn!(operation = %operation, error = %error, "Command failed");
                error.into()
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                tracing::error!(operation = %operation, reason = %reason, "Handler panicked");
                Response::error(format!("internal error in '{operation}': {reason}"))
            }
        }
    }
}

/// Extracts the message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn echo(args: &Fields) -> HandlerResult {
        Ok(args.clone())
    }

    fn dispatcher_with_counter() -> (Dispatcher, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = Registry::new();
        registry
            .register("echo", echo)
            .register("count", move |_: &Fields| -> HandlerResult {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Fields::new())
            });
        (Dispatcher::new(registry), calls)
    }

    #[test]
    fn routes_to_registered_handler() {
        let (dispatcher, _) = dispatcher_with_counter();
        let response = dispatcher.dispatch(json!({"operation": "echo", "args": {"x": 1}}));
        assert_eq!(response.to_value(), json!({"status": "ok", "x": 1}));
    }

    #[test]
    fn unknown_operation_echoes_name() {
        let (dispatcher, _) = dispatcher_with_counter();
        let response = dispatcher.dispatch(json!({"operation": "unknown_op", "args": {}}));
        assert_eq!(
            response.to_value(),
            json!({"status": "error", "message": "unknown operation 'unknown_op'"})
        );
    }

    #[test]
    fn missing_operation_invokes_no_handler() {
        let (dispatcher, calls) = dispatcher_with_counter();
        let response = dispatcher.dispatch(json!({"args": {}}));
        assert!(!response.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn non_object_document_is_structural_error() {
        let (dispatcher, calls) = dispatcher_with_counter();
        let response = dispatcher.dispatch(json!(["count"]));
        assert_eq!(
            response.message(),
            Some("invalid message format, expected JSON object")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn non_object_args_is_structural_error() {
        let (dispatcher, calls) = dispatcher_with_counter();
        let response = dispatcher.dispatch(json!({"operation": "count", "args": "x"}));
        assert!(!response.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn absent_args_default_to_empty() {
        let (dispatcher, calls) = dispatcher_with_counter();
        let response = dispatcher.dispatch(json!({"operation": "count"}));
        assert!(response.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_error_becomes_error_response() {
        let mut registry = Registry::new();
        registry.register("reject", |_: &Fields| -> HandlerResult {
            Err(CommandError::validation("width must be positive"))
        });
        let response = Dispatcher::new(registry).dispatch(json!({"operation": "reject"}));
        assert_eq!(response, Response::error("width must be positive"));
    }

    #[test]
    fn handler_panic_becomes_error_response() {
        let mut registry = Registry::new();
        registry.register("explode", |_: &Fields| -> HandlerResult {
            panic!("kaboom");
        });
        let response = Dispatcher::new(registry).dispatch(json!({"operation": "explode"}));
        let message = response.message().unwrap();
        assert!(message.contains("explode"));
        assert!(message.contains("kaboom"));
    }

    #[test]
    fn registry_enumerates_operations() {
        let (dispatcher, _) = dispatcher_with_counter();
        let operations: Vec<_> = dispatcher.registry().operations().collect();
        assert_eq!(operations, ["count", "echo"]);
        assert!(dispatcher.registry().contains("echo"));
        assert_eq!(dispatcher.registry().len(), 2);
    }

    #[test]
    fn empty_dispatcher_knows_nothing() {
        let dispatcher = Dispatcher::default();
        assert!(dispatcher.registry().is_empty());
        let response = dispatcher.dispatch(json!({"operation": "echo", "args": {"x": 1}}));
        assert_eq!(response.message(), Some("unknown operation 'echo'"));
    }
}
