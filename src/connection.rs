//! Connection lifecycle and the channel scheduler.
//!
//! A [`Connector`] owns the one broker connection a server or client uses.
//! Nothing but the connection's own execution context touches the channel:
//! other tasks and worker threads hand work to it through a [`Scheduler`],
//! which queues jobs that run one at a time, in order.
//!
//! Where the jobs run depends on the [`ConnectionMode`]:
//!
//! - `EventDriven`: a dedicated executor task drains the job queue.
//! - `Blocking`: the owner drains it from its own loop via
//!   [`Connector::next_job`] and [`Connector::run_job`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    BrokerFactoryPtr,
    BrokerPtr,
    ConnectionMode,
    ExchangeSpec,
    OutboundMessage,
    Result,
    RpcConfig,
    RpcError,
};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A unit of channel work. Receives the broker current at execution time.
pub type Job = Box<dyn FnOnce(BrokerPtr) -> BoxFuture<'static, Result<()>> + Send>;

/// Acquire mutex guard, ignoring poisoning
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    ChannelOpen,
    ExchangeDeclared,
    QueuesDeclared,
    Consuming,
    Closed,
}

/// What to do after the broker closed the connection unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// A deliberate shutdown was already under way.
    Stop,
    /// Try to reconnect once.
    Reconnect,
    /// Give up; the owner reports the loss.
    Fatal,
}

/// Named mutual-exclusion guard serializing every hand-off into the
/// connection's execution context.
pub struct ScheduleLock {
    name: String,
    inner: Mutex<()>,
}

impl ScheduleLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        lock_ignore_poison(&self.inner)
    }
}

impl std::fmt::Debug for ScheduleLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleLock").field("name", &self.name).finish()
    }
}

/// Cloneable handle for queuing channel work from any thread.
///
/// `schedule` is synchronous so it can be called from blocking worker
/// threads as well as from async tasks.
#[derive(Clone)]
pub struct Scheduler {
    lock: Arc<ScheduleLock>,
    tx: mpsc::UnboundedSender<Job>,
    generation: Arc<AtomicU64>,
}

impl Scheduler {
    // ---
    /// Queue `job` on the connection's execution context.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionLost`] once the connector is gone.
    pub fn schedule(&self, job: Job) -> Result<()> {
        // ---
        let _guard = self.lock.lock();
        self.tx.send(job).map_err(|_| RpcError::ConnectionLost)
    }

    /// Queue a publish.
    pub fn publish(&self, msg: OutboundMessage) -> Result<()> {
        self.schedule(Box::new(move |broker| {
            Box::pin(async move { broker.publish(msg).await })
        }))
    }

    /// Queue an ack for a delivery received on connection `generation`.
    ///
    /// If the connection was replaced before the job runs, the ack is
    /// skipped: the tag belongs to a dead channel and the broker will
    /// redeliver the message.
    pub fn ack(&self, delivery_tag: u64, generation: u64) -> Result<()> {
        // ---
        let current = Arc::clone(&self.generation);
        self.schedule(Box::new(move |broker| {
            Box::pin(async move {
                let now = current.load(Ordering::SeqCst);
                if now != generation {
                    log_warn!(
                        "skipping ack {delivery_tag}: received on generation {generation}, now {now}"
                    );
                    return Ok(());
                }
                broker.ack(delivery_tag).await
            })
        }))
    }

    /// Resolves once every job scheduled before this call has run.
    ///
    /// Only meaningful when something is draining the queue; in blocking
    /// mode use [`Connector::flush`].
    pub async fn flush(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.schedule(Box::new(move |_| {
            Box::pin(async move {
                let _ = tx.send(());
                Ok(())
            })
        }))?;
        rx.await.map_err(|_| RpcError::ConnectionLost)
    }

    /// Current connection generation. Starts at 1, bumped by each reconnect.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// The lock every `schedule` call takes.
    pub fn lock(&self) -> &Arc<ScheduleLock> {
        &self.lock
    }
}

/// Requests a deliberate stop of whoever owns the connection.
#[derive(Clone)]
pub struct ShutdownHandle {
    closing: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    /// Mark shutdown in progress and wake the owner. Idempotent.
    pub fn stop(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopping(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Resolves once `stop` has been called.
    pub async fn stopped(&self) {
        // ---
        loop {
            let notified = self.notify.notified();
            if self.is_stopping() {
                return;
            }
            notified.await;
        }
    }
}

/// Owns one broker connection: connect, exchange declaration, the job
/// queue, close handling, and reconnection.
pub struct Connector {
    factory: BrokerFactoryPtr,
    config: RpcConfig,
    prefetch: u16,
    state: Arc<Mutex<ConnectionState>>,
    current: Arc<Mutex<Option<BrokerPtr>>>,
    scheduler: Scheduler,
    jobs_rx: Option<mpsc::UnboundedReceiver<Job>>,
    executor: Option<JoinHandle<()>>,
    shutdown: ShutdownHandle,
}

impl Connector {
    // ---
    pub fn new(factory: BrokerFactoryPtr, config: RpcConfig) -> Self {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler {
            lock: Arc::new(ScheduleLock::new("msg-reply")),
            tx,
            generation: Arc::new(AtomicU64::new(1)),
        };

        Self {
            factory,
            prefetch: config.prefetch_count,
            config,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            current: Arc::new(Mutex::new(None)),
            scheduler,
            jobs_rx: Some(rx),
            executor: None,
            shutdown: ShutdownHandle {
                closing: Arc::new(AtomicBool::new(false)),
                notify: Arc::new(Notify::new()),
            },
        }
    }

    /// Override the prefetch count applied on connect.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn mode(&self) -> ConnectionMode {
        self.config.mode
    }

    pub fn state(&self) -> ConnectionState {
        *lock_ignore_poison(&self.state)
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        log_debug!("[{}] state -> {state:?}", self.config.connection_name);
        *lock_ignore_poison(&self.state) = state;
    }

    /// Shared view of the state for observers outliving a borrow.
    pub(crate) fn state_cell(&self) -> Arc<Mutex<ConnectionState>> {
        Arc::clone(&self.state)
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    pub fn generation(&self) -> u64 {
        self.scheduler.generation()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn is_closing(&self) -> bool {
        self.shutdown.is_stopping()
    }

    /// Resolves when [`ShutdownHandle::stop`] is called.
    pub async fn stopped(&self) {
        self.shutdown.stopped().await
    }

    /// Mark a deliberate shutdown.
    pub fn stop(&self) {
        self.shutdown.stop();
    }

    /// The live broker connection.
    pub fn broker(&self) -> Result<BrokerPtr> {
        lock_ignore_poison(&self.current)
            .clone()
            .ok_or(RpcError::ConnectionLost)
    }

    /// Open a connection and channel, apply prefetch, declare the exchange.
    pub async fn connect(&self) -> Result<BrokerPtr> {
        // ---
        let broker = self.factory.connect().await?;
        self.set_state(ConnectionState::ChannelOpen);

        broker.set_prefetch(self.prefetch).await?;

        let exchange = ExchangeSpec {
            name: self.config.exchange.clone(),
            durable: self.config.durable,
            auto_delete: self.config.auto_delete,
        };
        broker.declare_exchange(&exchange).await?;
        self.set_state(ConnectionState::ExchangeDeclared);

        log_info!(
            "[{}] connected as {}, exchange '{}'",
            self.config.connection_name,
            broker.broker_id(),
            exchange.name
        );

        *lock_ignore_poison(&self.current) = Some(Arc::clone(&broker));
        Ok(broker)
    }

    /// Replace a lost connection. One attempt; the caller decides what a
    /// failure means.
    pub async fn reconnect(&self) -> Result<BrokerPtr> {
        // ---
        let generation = self.scheduler.generation.fetch_add(1, Ordering::SeqCst) + 1;
        log_warn!(
            "[{}] reconnecting (generation {generation})",
            self.config.connection_name
        );

        let old = lock_ignore_poison(&self.current).take();
        if let Some(old) = old {
            let _ = old.close().await;
        }
        self.set_state(ConnectionState::Disconnected);

        self.connect().await
    }

    /// Decide how to react to an unexpected close.
    pub fn on_unexpected_close(&self) -> CloseAction {
        // ---
        if self.is_closing() {
            return CloseAction::Stop;
        }

        match self.config.mode {
            ConnectionMode::EventDriven => CloseAction::Reconnect,
            ConnectionMode::Blocking => CloseAction::Fatal,
        }
    }

    /// Event-driven mode: hand the job queue to a dedicated executor task.
    /// No-op in blocking mode or when already started.
    pub fn start_executor(&mut self) {
        // ---
        if self.config.mode != ConnectionMode::EventDriven {
            return;
        }
        let Some(mut rx) = self.jobs_rx.take() else {
            return;
        };

        let current = Arc::clone(&self.current);
        let name = self.config.connection_name.clone();

        self.executor = Some(tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                execute(&current, job, &name).await;
            }
        }));
    }

    /// Blocking mode: wait for the next scheduled job. Never resolves when
    /// an executor owns the queue.
    pub async fn next_job(&mut self) -> Option<Job> {
        // ---
        match self.jobs_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Blocking mode: run one job on the current connection.
    pub async fn run_job(&self, job: Job) {
        execute(&self.current, job, &self.config.connection_name).await;
    }

    /// Run every job scheduled so far.
    pub async fn flush(&mut self) -> Result<()> {
        // ---
        if self.executor.is_some() {
            return self.scheduler.flush().await;
        }

        while let Some(rx) = self.jobs_rx.as_mut() {
            let Ok(job) = rx.try_recv() else {
                break;
            };
            execute(&self.current, job, &self.config.connection_name).await;
        }
        Ok(())
    }

    /// Flush pending work, stop the executor, close the connection.
    pub async fn close(&mut self) -> Result<()> {
        // ---
        self.stop();

        if let Err(e) = self.flush().await {
            log_warn!("[{}] flush on close failed: {e}", self.config.connection_name);
        }
        if let Some(handle) = self.executor.take() {
            handle.abort();
        }

        let broker = lock_ignore_poison(&self.current).take();
        if let Some(broker) = broker {
            broker.close().await?;
        }

        self.set_state(ConnectionState::Closed);
        Ok(())
    }
}

async fn execute(current: &Mutex<Option<BrokerPtr>>, job: Job, name: &str) {
    // ---
    let broker = lock_ignore_poison(current).clone();
    let Some(broker) = broker else {
        log_warn!("[{name}] dropping scheduled job: no connection");
        return;
    };

    if let Err(e) = job(broker).await {
        log_warn!("[{name}] scheduled job failed: {e}");
    }
}
