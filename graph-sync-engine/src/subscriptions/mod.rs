//! Subscription lifecycle management.
//!
//! Subscribing to a record pulls its snapshot, emits it as an operation, and
//! keeps it fresh through remote watches; relationship subscriptions follow
//! the graph outward, subscribing to every record they reference. Each
//! subscription key is owned by one worker task, so activations and refreshes
//! for the same key are serialized while distinct keys proceed concurrently.
//!
//! Permission failures are absorbed: the denied subscription parks in
//! [`SubscriptionStatus::PermissionDenied`] and is excluded from whatever
//! listing or emission requested it, without failing the batch.
use crate::errors::SubscriptionError;
use crate::remote::{persisted_path, EventKind, RemoteEvent, RemoteStore, WatchHandle};
use crate::serializer::RecordSerializer;
use graph_sync_shared::{Cardinality, Operation, Path, PathShape, Schema};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

pub mod options;

pub use options::IncludeOptions;

/// Lifecycle of one subscription.
///
/// `PermissionDenied` and `Error` are terminal: a denied subscription is
/// inert and never retried; an errored one surfaces to the caller that
/// requested it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionStatus {
    #[default]
    New,
    Activating,
    Active,
    PermissionDenied,
    Error,
}

/// What a subscription path refers to, resolved from its shape and the
/// schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Record,
    Attribute,
    HasOne,
    HasMany,
}

#[derive(Debug, Default)]
struct SubState {
    status: SubscriptionStatus,
    /// Include options already applied; only a strict superset triggers a
    /// refresh.
    applied: IncludeOptions,
    /// Whether a hasOne subscription has emitted its link value yet. The
    /// first emission is an `add`, subsequent ones `replace`/`remove`.
    emitted_link: bool,
}

struct Job {
    path: Path,
    options: IncludeOptions,
    reply: oneshot::Sender<Result<SubscriptionStatus, SubscriptionError>>,
}

/// One live remote watch plus the task draining its events.
struct Listener {
    handle: WatchHandle,
    path: Path,
    kind: EventKind,
    task: JoinHandle<()>,
}

/// How events arriving on a watch translate into graph operations.
#[derive(Debug, Clone)]
enum WatchRole {
    Record { path: Path },
    Attribute { path: Path },
    HasOne { path: Path, options: IncludeOptions },
    MemberAdded { path: Path, member_options: IncludeOptions },
    MemberRemoved { path: Path },
    RecordAdded { model: String, options: IncludeOptions },
}

struct ManagerInner {
    schema: Arc<Schema>,
    remote: Arc<dyn RemoteStore>,
    serializer: RecordSerializer,
    operations: mpsc::UnboundedSender<Operation>,
    states: Mutex<HashMap<String, SubState>>,
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    /// Exactly one live remote watch per `path:event` key.
    listeners: Mutex<HashMap<String, Listener>>,
    outstanding: AtomicUsize,
    idle: Notify,
}

/// Owns every subscription in the process. See the module docs for the
/// worker and status model.
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(
        schema: Arc<Schema>,
        remote: Arc<dyn RemoteStore>,
        operations: mpsc::UnboundedSender<Operation>,
    ) -> Self {
        SubscriptionManager {
            inner: Arc::new(ManagerInner {
                serializer: RecordSerializer::new(schema.clone()),
                schema,
                remote,
                operations,
                states: Mutex::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Subscribes to `path` (creating the subscription if needed) and waits
    /// for it to settle. Returns the resulting status; a permission denial
    /// is a status, not an error.
    #[instrument(skip(self, options), fields(path = %path))]
    pub async fn subscribe(
        &self,
        path: &Path,
        options: IncludeOptions,
    ) -> Result<SubscriptionStatus, SubscriptionError> {
        self.inner.subscribe_and_wait(path, options).await
    }

    /// Resolves once no activate/refresh work is outstanding, transitively:
    /// a job's sub-jobs are counted before the job itself completes.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Sorted `path:event` keys of every live remote watch.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .listeners
            .lock()
            .expect("subscription lock poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn find_subscription(&self, path: &Path) -> Option<SubscriptionStatus> {
        self.inner
            .states
            .lock()
            .expect("subscription lock poisoned")
            .get(&path.canonical())
            .map(|state| state.status)
    }

    /// Watches a model's top-level node and subscribes every record that
    /// appears under it, so records created by other actors flow in without
    /// an explicit query.
    pub async fn watch_model(
        &self,
        model: &str,
        options: IncludeOptions,
    ) -> Result<(), SubscriptionError> {
        self.inner
            .register_watch(
                &Path::from_segments(vec![model.to_string()]),
                EventKind::ChildAdded,
                WatchRole::RecordAdded {
                    model: model.to_string(),
                    options,
                },
                false,
            )
            .await
    }

    /// Tears down every remote watch and worker.
    pub async fn unsubscribe_all(&self) -> Result<(), SubscriptionError> {
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .expect("subscription lock poisoned")
            .drain()
            .map(|(_, listener)| listener)
            .collect();
        for listener in listeners {
            listener.task.abort();
            self.inner
                .remote
                .unsubscribe(&listener.path, listener.kind, listener.handle)
                .await?;
        }
        self.inner
            .workers
            .lock()
            .expect("subscription lock poisoned")
            .clear();
        self.inner
            .states
            .lock()
            .expect("subscription lock poisoned")
            .clear();
        Ok(())
    }
}

impl ManagerInner {
    fn begin_job(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn finish_job(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn emit(&self, operation: Operation) {
        let _ = self.operations.send(operation);
    }

    /// Enqueues an activate/refresh job on the key's worker, spawning the
    /// worker on first use. The reply channel resolves when the job settles.
    fn ensure(
        self: &Arc<Self>,
        path: &Path,
        options: IncludeOptions,
    ) -> oneshot::Receiver<Result<SubscriptionStatus, SubscriptionError>> {
        let key = path.canonical();
        let (reply_tx, reply_rx) = oneshot::channel();
        let sender = {
            let mut workers = self.workers.lock().expect("subscription lock poisoned");
            workers
                .entry(key)
                .or_insert_with(|| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let inner = Arc::clone(self);
                    tokio::spawn(async move { inner.run_worker(rx).await });
                    tx
                })
                .clone()
        };
        self.begin_job();
        if sender
            .send(Job {
                path: path.clone(),
                options,
                reply: reply_tx,
            })
            .is_err()
        {
            // Worker gone; the dropped reply sender surfaces as WorkerGone
            // on the receiving side.
            self.finish_job();
        }
        reply_rx
    }

    async fn subscribe_and_wait(
        self: &Arc<Self>,
        path: &Path,
        options: IncludeOptions,
    ) -> Result<SubscriptionStatus, SubscriptionError> {
        self.ensure(path, options)
            .await
            .map_err(|_| SubscriptionError::WorkerGone(path.canonical()))?
    }

    async fn run_worker(self: Arc<Self>, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = jobs.recv().await {
            let result = self.handle_job(&job.path, job.options).await;
            let _ = job.reply.send(result);
            self.finish_job();
        }
    }

    async fn handle_job(
        self: &Arc<Self>,
        path: &Path,
        options: IncludeOptions,
    ) -> Result<SubscriptionStatus, SubscriptionError> {
        let key = path.canonical();
        let (status, applied) = {
            let mut states = self.states.lock().expect("subscription lock poisoned");
            let state = states.entry(key).or_default();
            (state.status, state.applied.clone())
        };
        match status {
            SubscriptionStatus::PermissionDenied => Ok(SubscriptionStatus::PermissionDenied),
            SubscriptionStatus::Error => Ok(SubscriptionStatus::Error),
            SubscriptionStatus::Active if !options.exceeds(&applied) => {
                Ok(SubscriptionStatus::Active)
            }
            SubscriptionStatus::Active => self.refresh(path, options).await,
            SubscriptionStatus::New | SubscriptionStatus::Activating => {
                self.activate(path, options).await
            }
        }
    }

    async fn activate(
        self: &Arc<Self>,
        path: &Path,
        options: IncludeOptions,
    ) -> Result<SubscriptionStatus, SubscriptionError> {
        let key = path.canonical();
        self.set_status(&key, SubscriptionStatus::Activating);

        let outcome = match self.kind_of(path)? {
            Kind::Record => self.activate_record(path, &options).await,
            Kind::Attribute => self.activate_attribute(path).await,
            Kind::HasOne => self.activate_has_one(path, &options).await,
            Kind::HasMany => self.activate_has_many(path, &options).await,
        };

        match outcome {
            Ok(()) => {
                let mut states = self.states.lock().expect("subscription lock poisoned");
                let state = states.entry(key).or_default();
                state.status = SubscriptionStatus::Active;
                state.applied = state.applied.union(&options);
                Ok(SubscriptionStatus::Active)
            }
            Err(err) if err.is_permission_denied() => {
                debug!(path = %key, "subscription denied, parking");
                self.set_status(&key, SubscriptionStatus::PermissionDenied);
                Ok(SubscriptionStatus::PermissionDenied)
            }
            Err(err) => {
                self.set_status(&key, SubscriptionStatus::Error);
                Err(err)
            }
        }
    }

    /// Re-applies a live subscription with wider include options. Follows
    /// newly covered links without re-emitting what is already synced.
    async fn refresh(
        self: &Arc<Self>,
        path: &Path,
        options: IncludeOptions,
    ) -> Result<SubscriptionStatus, SubscriptionError> {
        match self.kind_of(path)? {
            Kind::Record => {
                for link in self.schema.links_of(path.model())? {
                    if options.includes_link(link) {
                        let _ = self.ensure(
                            &Path::link(path.model(), path.id(), link),
                            options.for_link(link),
                        );
                    }
                }
            }
            Kind::HasOne => {
                let remote = persisted_path(path);
                if let Some(Value::String(related)) = self.remote.value_at(&remote).await? {
                    let related_model = self
                        .schema
                        .link_definition(path.model(), path.link_name())?
                        .model
                        .clone();
                    let _ = self.ensure(&Path::record(related_model, related), options.clone());
                }
            }
            Kind::HasMany => {
                let link_def = self.schema.link_definition(path.model(), path.link_name())?;
                let related_model = link_def.model.clone();
                let member_options = options.with_link(&link_def.inverse);
                let remote = persisted_path(path);
                if let Some(Value::Object(members)) = self.remote.value_at(&remote).await? {
                    for member in members.keys() {
                        let _ = self.ensure(
                            &Path::record(&related_model, member),
                            member_options.clone(),
                        );
                    }
                }
            }
            Kind::Attribute => {}
        }

        let mut states = self.states.lock().expect("subscription lock poisoned");
        let state = states.entry(path.canonical()).or_default();
        state.applied = state.applied.union(&options);
        Ok(SubscriptionStatus::Active)
    }

    async fn activate_record(
        self: &Arc<Self>,
        path: &Path,
        options: &IncludeOptions,
    ) -> Result<(), SubscriptionError> {
        let snapshot = self.remote.value_at(path).await?;
        match &snapshot {
            Some(value) => {
                let record = self.serializer.deserialize(path.model(), path.id(), value)?;
                self.emit(Operation::add(path.clone(), record.to_value()));
            }
            None => self.emit(Operation::remove(path.clone())),
        }

        self.register_watch(
            path,
            EventKind::ValueChanged,
            WatchRole::Record { path: path.clone() },
            true,
        )
        .await?;

        for attr in self.schema.attributes_of(path.model())? {
            let _ = self.ensure(
                &Path::attribute(path.model(), path.id(), attr),
                IncludeOptions::none(),
            );
        }
        for link in self.schema.links_of(path.model())? {
            if options.includes_link(link) {
                let _ = self.ensure(
                    &Path::link(path.model(), path.id(), link),
                    options.for_link(link),
                );
            }
        }
        Ok(())
    }

    async fn activate_attribute(self: &Arc<Self>, path: &Path) -> Result<(), SubscriptionError> {
        self.register_watch(
            path,
            EventKind::ValueChanged,
            WatchRole::Attribute { path: path.clone() },
            false,
        )
        .await
    }

    async fn activate_has_one(
        self: &Arc<Self>,
        path: &Path,
        options: &IncludeOptions,
    ) -> Result<(), SubscriptionError> {
        let remote = persisted_path(path);
        let snapshot = self.remote.value_at(&remote).await?;
        self.handle_has_one_value(path, options, snapshot.as_ref())
            .await?;
        self.register_watch(
            &remote,
            EventKind::ValueChanged,
            WatchRole::HasOne {
                path: path.clone(),
                options: options.clone(),
            },
            true,
        )
        .await
    }

    async fn activate_has_many(
        self: &Arc<Self>,
        path: &Path,
        options: &IncludeOptions,
    ) -> Result<(), SubscriptionError> {
        let link_def = self.schema.link_definition(path.model(), path.link_name())?;
        let related_model = link_def.model.clone();
        // Members subscribe with the inverse link included so their side of
        // the relationship stays in sync too.
        let member_options = options.with_link(&link_def.inverse);
        let remote = persisted_path(path);
        let snapshot = self.remote.value_at(&remote).await?;

        let mut active_members = Map::new();
        if let Some(Value::Object(members)) = snapshot {
            for member in members.keys() {
                let status = self
                    .subscribe_and_wait(
                        &Path::record(&related_model, member),
                        member_options.clone(),
                    )
                    .await?;
                if status == SubscriptionStatus::Active {
                    active_members.insert(member.clone(), Value::Bool(true));
                }
            }
        }
        // Container initialization lists only the members we could actually
        // read; denied ones are left out.
        self.emit(Operation::add(path.clone(), Value::Object(active_members)));

        self.register_watch(
            &remote,
            EventKind::ChildAdded,
            WatchRole::MemberAdded {
                path: path.clone(),
                member_options,
            },
            false,
        )
        .await?;
        self.register_watch(
            &remote,
            EventKind::ChildRemoved,
            WatchRole::MemberRemoved { path: path.clone() },
            false,
        )
        .await
    }

    /// Reacts to the current value of a hasOne: subscribes to the referenced
    /// record and emits the link operation, unless the reference was denied.
    async fn handle_has_one_value(
        self: &Arc<Self>,
        path: &Path,
        options: &IncludeOptions,
        value: Option<&Value>,
    ) -> Result<(), SubscriptionError> {
        match value {
            Some(Value::String(related)) => {
                let related_model = self
                    .schema
                    .link_definition(path.model(), path.link_name())?
                    .model
                    .clone();
                let status = self
                    .subscribe_and_wait(&Path::record(related_model, related), options.clone())
                    .await?;
                if status == SubscriptionStatus::Active {
                    let first = self.mark_link_emitted(&path.canonical());
                    let value = Value::String(related.clone());
                    let operation = if first {
                        Operation::add(path.clone(), value)
                    } else {
                        Operation::replace(path.clone(), value)
                    };
                    self.emit(operation);
                }
            }
            _ => {
                let first = self.mark_link_emitted(&path.canonical());
                if first {
                    self.emit(Operation::add(path.clone(), Value::Null));
                } else {
                    self.emit(Operation::remove(path.clone()));
                }
            }
        }
        Ok(())
    }

    /// Registers one remote watch per `path:event` key; repeat requests
    /// reuse the existing registration.
    async fn register_watch(
        self: &Arc<Self>,
        remote_path: &Path,
        kind: EventKind,
        role: WatchRole,
        skip_first: bool,
    ) -> Result<(), SubscriptionError> {
        let registry_key = format!("{}:{}", remote_path.canonical(), kind.token());
        if self
            .listeners
            .lock()
            .expect("subscription lock poisoned")
            .contains_key(&registry_key)
        {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = self.remote.subscribe(remote_path, kind, tx).await?;
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            // The first event of a value watch duplicates the snapshot the
            // activation already consumed.
            let mut skip = skip_first;
            while let Some(event) = rx.recv().await {
                if std::mem::take(&mut skip) {
                    continue;
                }
                inner.begin_job();
                inner.handle_event(&role, event).await;
                inner.finish_job();
            }
        });
        self.listeners
            .lock()
            .expect("subscription lock poisoned")
            .insert(
                registry_key,
                Listener {
                    handle,
                    path: remote_path.clone(),
                    kind,
                    task,
                },
            );
        Ok(())
    }

    async fn handle_event(self: &Arc<Self>, role: &WatchRole, event: RemoteEvent) {
        match role {
            WatchRole::Record { path } => match &event.value {
                Some(value) => {
                    match self.serializer.deserialize(path.model(), path.id(), value) {
                        Ok(record) => self.emit(Operation::add(path.clone(), record.to_value())),
                        Err(err) => warn!(path = %path, %err, "dropping undecodable record event"),
                    }
                }
                None => self.emit(Operation::remove(path.clone())),
            },
            WatchRole::Attribute { path } => {
                self.emit(Operation::replace(
                    path.clone(),
                    event.value.clone().unwrap_or(Value::Null),
                ));
            }
            WatchRole::HasOne { path, options } => {
                if let Err(err) = self
                    .handle_has_one_value(path, options, event.value.as_ref())
                    .await
                {
                    warn!(path = %path, %err, "failed to apply hasOne event");
                }
            }
            WatchRole::MemberAdded {
                path,
                member_options,
            } => {
                let related_model = match self.schema.link_definition(path.model(), path.link_name())
                {
                    Ok(link_def) => link_def.model.clone(),
                    Err(err) => {
                        warn!(path = %path, %err, "dropping member event for undeclared link");
                        return;
                    }
                };
                match self
                    .subscribe_and_wait(
                        &Path::record(related_model, &event.key),
                        member_options.clone(),
                    )
                    .await
                {
                    Ok(SubscriptionStatus::Active) => {
                        self.emit(Operation::add(path.join(&event.key), Value::Bool(true)));
                    }
                    Ok(_) => {}
                    Err(err) => warn!(path = %path, %err, "failed to subscribe new member"),
                }
            }
            WatchRole::MemberRemoved { path } => {
                self.emit(Operation::remove(path.join(&event.key)));
            }
            WatchRole::RecordAdded { model, options } => {
                if let Err(err) = self
                    .subscribe_and_wait(&Path::record(model.as_str(), &event.key), options.clone())
                    .await
                {
                    warn!(model = %model, key = %event.key, %err, "failed to subscribe new record");
                }
            }
        }
    }

    fn kind_of(&self, path: &Path) -> Result<Kind, SubscriptionError> {
        match path.shape() {
            PathShape::Record => Ok(Kind::Record),
            PathShape::Attribute => Ok(Kind::Attribute),
            PathShape::Link => {
                let link_def = self.schema.link_definition(path.model(), path.link_name())?;
                Ok(match link_def.cardinality {
                    Cardinality::HasOne => Kind::HasOne,
                    Cardinality::HasMany => Kind::HasMany,
                })
            }
            PathShape::LinkMember | PathShape::Malformed => {
                Err(SubscriptionError::UnsupportedPath(path.canonical()))
            }
        }
    }

    fn set_status(&self, key: &str, status: SubscriptionStatus) {
        let mut states = self.states.lock().expect("subscription lock poisoned");
        states.entry(key.to_string()).or_default().status = status;
    }

    /// Flips the hasOne emitted flag; true means this is the first emission.
    fn mark_link_emitted(&self, key: &str) -> bool {
        let mut states = self.states.lock().expect("subscription lock poisoned");
        let state = states.entry(key.to_string()).or_default();
        let first = !state.emitted_link;
        state.emitted_link = true;
        first
    }
}
