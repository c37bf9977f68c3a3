//! Handlers for queue names, registered once at startup.

use crate::error::QueueError;
use crate::Job;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Processes jobs of one queue.
///
/// `Ok` completes the job with the optional result text; `Err` fails it and
/// lets the retry policy decide whether it runs again.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> anyhow::Result<Option<String>>;
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, queue_name: impl Into<String>, handler: impl JobHandler) -> Self {
        self.handlers.insert(queue_name.into(), Arc::new(handler));
        self
    }

    pub fn handler(&self, queue_name: &str) -> Result<Arc<dyn JobHandler>, QueueError> {
        self.handlers
            .get(queue_name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownHandler(queue_name.to_string()))
    }

    /// Registered queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("queues", &self.queue_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn handle(&self, job: &Job) -> anyhow::Result<Option<String>> {
            Ok(Some(job.payload.clone()))
        }
    }

    #[test]
    fn unknown_queue_is_a_typed_error() {
        let registry = HandlerRegistry::new().register("webhooks", Echo);

        assert!(registry.handler("webhooks").is_ok());
        assert!(matches!(
            registry.handler("outbound-messages"),
            Err(QueueError::UnknownHandler(name)) if name == "outbound-messages"
        ));
    }

    #[test]
    fn lists_registered_queues() {
        let registry = HandlerRegistry::new()
            .register("webhooks", Echo)
            .register("outbound-messages", Echo);

        assert_eq!(registry.queue_names(), vec!["outbound-messages", "webhooks"]);
        assert!(!registry.is_empty());
    }
}
