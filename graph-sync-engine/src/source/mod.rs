//! The source coordinator.
//!
//! `GraphSource` wires the whole engine together: local writes are expanded
//! into their relationship closure, registered with the echo filter, applied
//! to the cache, and persisted; remote-originated operations flow from the
//! subscription manager through the filter and the sequencer into the cache,
//! and every admitted operation fans out to `transforms()` listeners in
//! admission order.
use crate::cache::{GraphCache, MemoryCache};
use crate::errors::{CacheError, SourceError};
use crate::expander::{is_uninitialized_payload, RelationshipExpander};
use crate::filter::OperationFilter;
use crate::remote::RemoteStore;
use crate::requester::GraphRequester;
use crate::sequencer::OperationSequencer;
use crate::subscriptions::{IncludeOptions, SubscriptionManager, SubscriptionStatus};
use crate::writer::GraphWriter;
use graph_sync_shared::{LinkValue, OpKind, Operation, Path, PathShape, Record, Schema};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

pub struct GraphSource {
    schema: Arc<Schema>,
    cache: Arc<MemoryCache>,
    expander: RelationshipExpander,
    filter: Arc<Mutex<OperationFilter>>,
    subscriptions: Arc<SubscriptionManager>,
    requester: GraphRequester,
    writer: GraphWriter,
    listeners: Arc<Mutex<Vec<mpsc::UnboundedSender<Operation>>>>,
    ingest: JoinHandle<()>,
}

impl GraphSource {
    /// Builds the engine around a remote store and starts the ingest task.
    /// Must be called from within a tokio runtime.
    pub fn new(schema: Arc<Schema>, remote: Arc<dyn RemoteStore>) -> Self {
        let cache = Arc::new(MemoryCache::new(schema.clone()));
        let filter = Arc::new(Mutex::new(OperationFilter::new()));
        let listeners: Arc<Mutex<Vec<mpsc::UnboundedSender<Operation>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let (operations_tx, operations_rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(SubscriptionManager::new(
            schema.clone(),
            remote.clone(),
            operations_tx,
        ));

        let sequencer = OperationSequencer::new(
            schema.clone(),
            cache.clone() as Arc<dyn GraphCache>,
        );
        let ingest = tokio::spawn(Self::ingest(
            operations_rx,
            filter.clone(),
            sequencer,
            listeners.clone(),
        ));

        GraphSource {
            expander: RelationshipExpander::new(schema.clone()),
            requester: GraphRequester::new(schema.clone(), remote.clone(), subscriptions.clone()),
            writer: GraphWriter::new(schema.clone(), remote),
            schema,
            cache,
            filter,
            subscriptions,
            listeners,
            ingest,
        }
    }

    /// Remote-originated operations: suppress self-echoes, let the sequencer
    /// defer or admit, fan out what was admitted.
    async fn ingest(
        mut operations: mpsc::UnboundedReceiver<Operation>,
        filter: Arc<Mutex<OperationFilter>>,
        mut sequencer: OperationSequencer,
        listeners: Arc<Mutex<Vec<mpsc::UnboundedSender<Operation>>>>,
    ) {
        while let Some(operation) = operations.recv().await {
            if filter
                .lock()
                .expect("filter lock poisoned")
                .blocks_next(&operation)
            {
                continue;
            }
            let admitted = match sequencer.process(&operation) {
                Ok(admitted) => admitted,
                Err(err) => {
                    warn!(path = %operation.path, %err, "dropping unprocessable operation");
                    continue;
                }
            };
            if admitted.is_empty() {
                continue;
            }
            let mut listeners = listeners.lock().expect("listener lock poisoned");
            for operation in admitted {
                listeners.retain(|tx| tx.send(operation.clone()).is_ok());
            }
        }
    }

    /// Applies one local write: expands it to its relationship closure, then
    /// for every closure operation registers the expected echo, mutates the
    /// cache, and persists to the remote store and the operation log.
    ///
    /// Transport failures propagate; the local mutation is not rolled back.
    #[instrument(skip(self, operation), fields(path = %operation.path))]
    pub async fn transform(&self, operation: &Operation) -> Result<(), SourceError> {
        // A sentinel-valued relationship write carries no information.
        if is_uninitialized_payload(operation) {
            return Ok(());
        }

        let closure = self.expander.expand(self.cache.as_ref(), operation)?;
        if closure.is_empty() {
            return Ok(());
        }
        if !closure.iter().any(|op| op.path == operation.path) {
            return Err(SourceError::MissingTrigger(operation.path.canonical()));
        }

        for op in &closure {
            self.filter
                .lock()
                .expect("filter lock poisoned")
                .block_next(op);
            match self.cache.transform(op) {
                Ok(_) => {}
                // A closure can carry link ops for a record an earlier
                // closure op removed; those are vacuous locally but still
                // persisted.
                Err(CacheError::MissingRecord(_)) => {}
                Err(err) => return Err(err.into()),
            }
            self.writer.apply(op).await?;
            self.writer.log(op).await?;
        }

        if operation.path.shape() == PathShape::Record && operation.op == OpKind::Add {
            let links = self.schema.links_of(operation.path.model())?;
            let options = IncludeOptions::from_links(&links);
            self.subscriptions
                .subscribe(&operation.path, options)
                .await?;
        }
        Ok(())
    }

    pub async fn find(
        &self,
        model: &str,
        id: &str,
        options: IncludeOptions,
    ) -> Result<Record, SourceError> {
        self.requester.find(model, id, options).await
    }

    pub async fn find_all(&self, model: &str) -> Result<Vec<Record>, SourceError> {
        self.requester.find_all(model).await
    }

    pub async fn find_link(
        &self,
        model: &str,
        id: &str,
        link: &str,
    ) -> Result<LinkValue, SourceError> {
        self.requester.find_link(model, id, link).await
    }

    pub async fn find_linked(
        &self,
        model: &str,
        id: &str,
        link: &str,
    ) -> Result<Vec<Record>, SourceError> {
        self.requester.find_linked(model, id, link).await
    }

    pub async fn subscribe(
        &self,
        path: &Path,
        options: IncludeOptions,
    ) -> Result<SubscriptionStatus, SourceError> {
        Ok(self.subscriptions.subscribe(path, options).await?)
    }

    /// A new receiver of admitted operations, one per atomic cache mutation,
    /// in admission order.
    pub fn transforms(&self) -> mpsc::UnboundedReceiver<Operation> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push(tx);
        rx
    }

    pub fn cache(&self) -> Arc<dyn GraphCache> {
        self.cache.clone()
    }

    /// Sorted `path:event` keys of every live remote watch.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.subscriptions()
    }

    pub fn find_subscription(&self, path: &Path) -> Option<SubscriptionStatus> {
        self.subscriptions.find_subscription(path)
    }

    pub async fn unsubscribe_all(&self) -> Result<(), SourceError> {
        Ok(self.subscriptions.unsubscribe_all().await?)
    }

    /// Checkpoint: resolves once every requested subscription has activated
    /// or been denied.
    pub async fn drain(&self) {
        self.subscriptions.drain().await;
        // Give the ingest task a chance to flush operations that were
        // emitted right before the barrier resolved.
        tokio::task::yield_now().await;
    }
}

impl Drop for GraphSource {
    fn drop(&mut self) {
        self.ingest.abort();
    }
}
