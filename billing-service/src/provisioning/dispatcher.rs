use crate::models::{ActionLock, ActionStatus, ActionTaskArgs, ServiceStatus, Task};
use crate::provisioning::extension::{queue_name, Extension, ExtensionRegistry};
use crate::services::broker::Broker;
use crate::services::database::Database;
use crate::services::error::BillingError;
use crate::services::metrics::record_action_dispatch;
use crate::workers::{TaskHandler, TaskQueue};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

pub fn lock_key(service_id: i32) -> String {
    format!("service_{}_action_lock", service_id)
}

pub fn info_key(service_id: i32) -> String {
    format!("service_{}_action_info", service_id)
}

pub fn error_key(service_id: i32) -> String {
    format!("service_{}_action_error", service_id)
}

const LOCK_PATTERN: &str = "service_*_action_lock";

/// Where the worker reads the current status and writes the target status
/// after a successful action.
#[async_trait]
pub trait ServiceStore: Send + Sync {
    /// Current status, `None` when the service does not exist.
    async fn service_status(&self, service_id: i32)
        -> Result<Option<ServiceStatus>, BillingError>;

    async fn set_service_status(
        &self,
        service_id: i32,
        status: ServiceStatus,
    ) -> Result<(), BillingError>;
}

#[async_trait]
impl ServiceStore for Database {
    async fn service_status(
        &self,
        service_id: i32,
    ) -> Result<Option<ServiceStatus>, BillingError> {
        Ok(self
            .find_service(self.pool(), service_id)
            .await?
            .and_then(|service| service.status()))
    }

    async fn set_service_status(
        &self,
        service_id: i32,
        status: ServiceStatus,
    ) -> Result<(), BillingError> {
        let mut tx = self.pool().begin().await?;

        let service = self
            .find_service_for_update(&mut *tx, service_id)
            .await?
            .ok_or(BillingError::ServiceNotFound(service_id))?;

        // CANCELLED is terminal, even for an action queued before the cancellation.
        if service.is_cancelled() && status != ServiceStatus::Cancelled {
            return Err(BillingError::ServiceCancelled);
        }

        self.update_service_status(&mut *tx, service_id, status)
            .await?;
        tx.commit().await?;

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Attempts given to each action task.
    pub attempts: u32,
    /// Safety expiry on the action lock. `None` keeps the lock until released.
    pub lock_ttl: Option<Duration>,
    pub flash_ttl: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            attempts: 1,
            lock_ttl: Some(Duration::from_secs(3600)),
            flash_ttl: Duration::from_secs(60),
        }
    }
}

/// Entry point for running extension actions on services. Holds the per-service
/// action lock from enqueue until the worker finishes an attempt.
#[derive(Clone)]
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    extensions: Arc<ExtensionRegistry>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        extensions: Arc<ExtensionRegistry>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            broker,
            extensions,
            settings,
        }
    }

    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    pub fn queue(&self, extension: &str) -> TaskQueue {
        TaskQueue::new(queue_name(extension), Arc::clone(&self.broker))
    }

    /// Lock the service and enqueue `action` for the extension's workers.
    /// Returns as soon as the task is queued.
    #[tracing::instrument(skip(self), fields(new_status = ?new_status))]
    pub async fn do_action_async(
        &self,
        extension: &str,
        service_id: i32,
        action: &str,
        new_status: Option<ServiceStatus>,
    ) -> Result<(), BillingError> {
        self.extensions.get(extension)?;

        let lock = ActionLock {
            description: format!("Pending action: {}", action.to_uppercase()),
            acquired_at: Utc::now().timestamp(),
        };
        let acquired = self
            .broker
            .set_nx(
                &lock_key(service_id),
                &serde_json::to_string(&lock)?,
                self.settings.lock_ttl,
            )
            .await?;

        if !acquired {
            record_action_dispatch(extension, "rejected");
            return Err(BillingError::ActionAlreadyRunning);
        }

        let args = serde_json::to_value(ActionTaskArgs {
            service_id,
            action: action.to_string(),
            new_status,
        })?;
        let description = format!("{} service #{}", action, service_id);

        if let Err(e) = self
            .queue(extension)
            .enqueue(&description, args, self.settings.attempts)
            .await
        {
            record_action_dispatch(extension, "failed");
            self.release_lock(service_id).await;
            return Err(e);
        }

        record_action_dispatch(extension, "enqueued");
        tracing::info!(service_id = service_id, action = action, "Action enqueued");

        Ok(())
    }

    /// Pending action plus one-shot result messages. Reading consumes the messages.
    pub async fn action_status(&self, service_id: i32) -> Result<ActionStatus, BillingError> {
        let pending = self
            .broker
            .get(&lock_key(service_id))
            .await?
            .map(|raw| match serde_json::from_str::<ActionLock>(&raw) {
                Ok(lock) => lock.description,
                Err(_) => raw,
            });

        Ok(ActionStatus {
            pending,
            info: self.broker.get_del(&info_key(service_id)).await?,
            error: self.broker.get_del(&error_key(service_id)).await?,
        })
    }

    /// Delete action locks held longer than `threshold`. Returns how many were removed.
    pub async fn release_stale_locks(&self, threshold: Duration) -> Result<usize, BillingError> {
        let now = Utc::now().timestamp();
        let mut released = 0;

        for key in self.broker.keys(LOCK_PATTERN).await? {
            let Some(raw) = self.broker.get(&key).await? else {
                continue;
            };

            let stale = match serde_json::from_str::<ActionLock>(&raw) {
                Ok(lock) => now.saturating_sub(lock.acquired_at) >= threshold.as_secs() as i64,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Unreadable action lock, releasing");
                    true
                }
            };

            if stale {
                self.broker.del(&key).await?;
                released += 1;
                tracing::warn!(key = %key, "Released stale action lock");
            }
        }

        Ok(released)
    }

    /// Worker-side handler for one extension's queue.
    pub fn handler(
        &self,
        extension: Arc<dyn Extension>,
        store: Arc<dyn ServiceStore>,
    ) -> ActionHandler {
        ActionHandler {
            dispatcher: self.clone(),
            extension,
            store,
        }
    }

    async fn release_lock(&self, service_id: i32) {
        if let Err(e) = self.broker.del(&lock_key(service_id)).await {
            tracing::error!(service_id = service_id, error = %e, "Failed to release action lock");
        }
    }

    async fn flash(&self, key: &str, message: &str) {
        if let Err(e) = self
            .broker
            .set_ex(key, message, self.settings.flash_ttl)
            .await
        {
            tracing::warn!(key = %key, error = %e, "Failed to record action result");
        }
    }
}

/// Runs queued actions against an extension and applies the target status.
pub struct ActionHandler {
    dispatcher: Dispatcher,
    extension: Arc<dyn Extension>,
    store: Arc<dyn ServiceStore>,
}

enum ActionOutcome {
    Applied,
    /// The service was cancelled before the action could take effect.
    Superseded,
}

/// Actions that bring a service down are still allowed on a CANCELLED one.
fn tears_down(args: &ActionTaskArgs) -> bool {
    args.action == "terminate" || args.new_status == Some(ServiceStatus::Cancelled)
}

impl ActionHandler {
    async fn run(&self, args: &ActionTaskArgs) -> anyhow::Result<ActionOutcome> {
        if !tears_down(args)
            && self.store.service_status(args.service_id).await? == Some(ServiceStatus::Cancelled)
        {
            return Ok(ActionOutcome::Superseded);
        }

        let outcome = AssertUnwindSafe(self.extension.action(args.service_id, &args.action))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(panic) => anyhow::bail!("extension panicked: {}", panic_message(&*panic)),
        }

        if let Some(status) = args.new_status {
            match self.store.set_service_status(args.service_id, status).await {
                Ok(()) => {}
                // Cancelled while the backend call ran. Retrying cannot change that.
                Err(BillingError::ServiceCancelled) => return Ok(ActionOutcome::Superseded),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(ActionOutcome::Applied)
    }
}

#[async_trait]
impl TaskHandler for ActionHandler {
    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        let args: ActionTaskArgs = match serde_json::from_value(task.args.clone()) {
            Ok(args) => args,
            Err(e) => {
                tracing::error!(
                    description = %task.description,
                    error = %e,
                    "Discarding action task with unusable arguments"
                );
                return Ok(());
            }
        };
        let service_id = args.service_id;
        let label = args.action.to_uppercase();

        // Every exit flashes the result and then releases the lock, retries included.
        match self.run(&args).await {
            Ok(ActionOutcome::Applied) => {
                self.dispatcher
                    .flash(
                        &info_key(service_id),
                        &format!("Action {} succeeded", label),
                    )
                    .await;
                self.dispatcher.release_lock(service_id).await;

                tracing::info!(
                    extension = %self.extension.name(),
                    service_id = service_id,
                    action = %args.action,
                    "Action succeeded"
                );
                Ok(())
            }
            Ok(ActionOutcome::Superseded) => {
                self.dispatcher
                    .flash(
                        &error_key(service_id),
                        &format!("Action {} skipped, service is cancelled", label),
                    )
                    .await;
                self.dispatcher.release_lock(service_id).await;

                tracing::warn!(
                    extension = %self.extension.name(),
                    service_id = service_id,
                    action = %args.action,
                    "Service cancelled, action skipped"
                );
                Ok(())
            }
            Err(source) => {
                let err = BillingError::BackendActionFailed {
                    service_id,
                    action: args.action.clone(),
                    source,
                };

                self.dispatcher
                    .flash(&error_key(service_id), &format!("Action {} failed", label))
                    .await;
                self.dispatcher.release_lock(service_id).await;

                tracing::error!(
                    extension = %self.extension.name(),
                    error = %err,
                    attempts_remaining = task.attempts,
                    "Action failed"
                );
                Err(err.into())
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::extension::SettingField;
    use crate::services::broker::MemoryBroker;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        statuses: Mutex<HashMap<i32, ServiceStatus>>,
        /// Cancel the service right after the worker reads its status.
        cancel_after_read: AtomicBool,
    }

    #[async_trait]
    impl ServiceStore for MemoryStore {
        async fn service_status(
            &self,
            service_id: i32,
        ) -> Result<Option<ServiceStatus>, BillingError> {
            let mut statuses = self.statuses.lock().unwrap();
            let current = statuses.get(&service_id).copied();
            if self.cancel_after_read.load(Ordering::SeqCst) {
                statuses.insert(service_id, ServiceStatus::Cancelled);
            }
            Ok(current)
        }

        async fn set_service_status(
            &self,
            service_id: i32,
            status: ServiceStatus,
        ) -> Result<(), BillingError> {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.get(&service_id) == Some(&ServiceStatus::Cancelled)
                && status != ServiceStatus::Cancelled
            {
                return Err(BillingError::ServiceCancelled);
            }
            statuses.insert(service_id, status);
            Ok(())
        }
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Fail,
        Panic,
    }

    struct Scripted {
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Extension for Scripted {
        fn name(&self) -> &str {
            "Scripted"
        }

        async fn product_settings(
            &self,
            _inputs: &HashMap<String, String>,
        ) -> anyhow::Result<Vec<SettingField>> {
            Ok(Vec::new())
        }

        async fn server_settings(&self) -> anyhow::Result<Vec<SettingField>> {
            Ok(Vec::new())
        }

        async fn action(&self, _service_id: i32, _action: &str) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => anyhow::bail!("hypervisor unreachable"),
                Behaviour::Panic => panic!("driver bug"),
            }
        }

        async fn client_actions(&self, _service_id: i32) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn admin_actions(&self, _service_id: i32) -> anyhow::Result<Vec<String>> {
            Ok(vec!["create".to_string()])
        }
    }

    struct Fixture {
        broker: Arc<MemoryBroker>,
        dispatcher: Dispatcher,
        store: Arc<MemoryStore>,
        extension: Arc<Scripted>,
    }

    fn fixture(behaviour: Behaviour) -> (Fixture, ActionHandler) {
        let broker = Arc::new(MemoryBroker::new());
        let extension = Arc::new(Scripted {
            behaviour,
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(ExtensionRegistry::new().with(extension.clone()));
        let dispatcher = Dispatcher::new(broker.clone(), registry, DispatchSettings::default());
        let store = Arc::new(MemoryStore::default());
        let handler = dispatcher.handler(extension.clone(), store.clone());
        (
            Fixture {
                broker,
                dispatcher,
                store,
                extension,
            },
            handler,
        )
    }

    async fn next_task(fx: &Fixture) -> Task {
        let raw = fx
            .broker
            .pop(
                &fx.dispatcher.queue("Scripted").list_key(),
                Duration::from_millis(10),
            )
            .await
            .unwrap()
            .expect("a queued task");
        let mut task: Task = serde_json::from_str(&raw).unwrap();
        task.attempts = task.attempts.saturating_sub(1);
        task
    }

    #[tokio::test]
    async fn second_dispatch_is_rejected_before_enqueue() {
        let (fx, _) = fixture(Behaviour::Succeed);

        fx.dispatcher
            .do_action_async("Scripted", 7, "create", Some(ServiceStatus::Active))
            .await
            .unwrap();
        let second = fx
            .dispatcher
            .do_action_async("Scripted", 7, "suspend", None)
            .await;

        assert!(matches!(second, Err(BillingError::ActionAlreadyRunning)));
        let list = fx.dispatcher.queue("Scripted").list_key();
        assert_eq!(fx.broker.list_len(&list), 1);
    }

    #[tokio::test]
    async fn unknown_extension_takes_no_lock() {
        let (fx, _) = fixture(Behaviour::Succeed);

        let result = fx.dispatcher.do_action_async("Missing", 3, "create", None).await;

        assert!(matches!(result, Err(BillingError::ExtensionNotFound(_))));
        assert_eq!(fx.broker.get(&lock_key(3)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn success_applies_status_and_releases_lock() {
        let (fx, handler) = fixture(Behaviour::Succeed);
        fx.dispatcher
            .do_action_async("Scripted", 7, "create", Some(ServiceStatus::Active))
            .await
            .unwrap();

        let status = fx.dispatcher.action_status(7).await.unwrap();
        assert_eq!(status.pending.as_deref(), Some("Pending action: CREATE"));

        let task = next_task(&fx).await;
        handler.handle(&task).await.unwrap();

        assert_eq!(
            fx.store.statuses.lock().unwrap().get(&7),
            Some(&ServiceStatus::Active)
        );
        let status = fx.dispatcher.action_status(7).await.unwrap();
        assert_eq!(
            status,
            ActionStatus {
                pending: None,
                info: Some("Action CREATE succeeded".to_string()),
                error: None,
            }
        );
        // Flash messages are read once.
        assert_eq!(fx.dispatcher.action_status(7).await.unwrap(), ActionStatus::default());
    }

    #[tokio::test]
    async fn failure_with_retries_left_still_releases_lock() {
        let (fx, handler) = fixture(Behaviour::Fail);
        fx.dispatcher
            .do_action_async("Scripted", 9, "create", Some(ServiceStatus::Active))
            .await
            .unwrap();

        let mut task = next_task(&fx).await;
        task.attempts = 1;
        assert!(handler.handle(&task).await.is_err());

        let status = fx.dispatcher.action_status(9).await.unwrap();
        assert_eq!(status.pending, None);
        assert_eq!(status.error.as_deref(), Some("Action CREATE failed"));
    }

    #[tokio::test]
    async fn cancelled_service_skips_backend_action() {
        let (fx, handler) = fixture(Behaviour::Succeed);
        fx.store
            .statuses
            .lock()
            .unwrap()
            .insert(4, ServiceStatus::Cancelled);
        fx.dispatcher
            .do_action_async("Scripted", 4, "create", Some(ServiceStatus::Active))
            .await
            .unwrap();

        let mut task = next_task(&fx).await;
        task.attempts = 2;
        handler.handle(&task).await.unwrap();

        assert_eq!(fx.extension.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            fx.store.statuses.lock().unwrap().get(&4),
            Some(&ServiceStatus::Cancelled)
        );
        let status = fx.dispatcher.action_status(4).await.unwrap();
        assert_eq!(status.pending, None);
        assert_eq!(
            status.error.as_deref(),
            Some("Action CREATE skipped, service is cancelled")
        );
    }

    #[tokio::test]
    async fn terminate_runs_on_cancelled_service() {
        let (fx, handler) = fixture(Behaviour::Succeed);
        fx.store
            .statuses
            .lock()
            .unwrap()
            .insert(6, ServiceStatus::Cancelled);
        fx.dispatcher
            .do_action_async("Scripted", 6, "terminate", Some(ServiceStatus::Cancelled))
            .await
            .unwrap();

        handler.handle(&next_task(&fx).await).await.unwrap();

        assert_eq!(fx.extension.calls.load(Ordering::SeqCst), 1);
        let status = fx.dispatcher.action_status(6).await.unwrap();
        assert_eq!(status.info.as_deref(), Some("Action TERMINATE succeeded"));
    }

    #[tokio::test]
    async fn cancellation_during_action_is_not_retried() {
        let (fx, handler) = fixture(Behaviour::Succeed);
        fx.store
            .statuses
            .lock()
            .unwrap()
            .insert(8, ServiceStatus::Pending);
        fx.store.cancel_after_read.store(true, Ordering::SeqCst);
        fx.dispatcher
            .do_action_async("Scripted", 8, "create", Some(ServiceStatus::Active))
            .await
            .unwrap();

        let mut task = next_task(&fx).await;
        task.attempts = 2;
        handler.handle(&task).await.unwrap();

        assert_eq!(fx.extension.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            fx.store.statuses.lock().unwrap().get(&8),
            Some(&ServiceStatus::Cancelled)
        );
        assert_eq!(fx.broker.get(&lock_key(8)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn terminal_failure_releases_lock_and_flags_error() {
        let (fx, handler) = fixture(Behaviour::Fail);
        fx.dispatcher
            .do_action_async("Scripted", 9, "create", Some(ServiceStatus::Active))
            .await
            .unwrap();

        let task = next_task(&fx).await;
        let err = handler.handle(&task).await.unwrap_err();
        assert!(err.to_string().contains("hypervisor unreachable"));

        assert!(fx.store.statuses.lock().unwrap().is_empty());
        let status = fx.dispatcher.action_status(9).await.unwrap();
        assert_eq!(status.pending, None);
        assert_eq!(status.error.as_deref(), Some("Action CREATE failed"));
    }

    #[tokio::test]
    async fn panicking_extension_still_releases_lock() {
        let (fx, handler) = fixture(Behaviour::Panic);
        fx.dispatcher
            .do_action_async("Scripted", 11, "terminate", Some(ServiceStatus::Cancelled))
            .await
            .unwrap();

        let task = next_task(&fx).await;
        let err = handler.handle(&task).await.unwrap_err();
        assert!(err.to_string().contains("driver bug"));

        assert_eq!(fx.broker.get(&lock_key(11)).await.unwrap(), None);
        assert!(fx.store.statuses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_can_be_retaken_after_completion() {
        let (fx, handler) = fixture(Behaviour::Succeed);
        fx.dispatcher
            .do_action_async("Scripted", 5, "create", None)
            .await
            .unwrap();
        handler.handle(&next_task(&fx).await).await.unwrap();

        fx.dispatcher
            .do_action_async("Scripted", 5, "suspend", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn only_old_locks_are_reaped() {
        let (fx, _) = fixture(Behaviour::Succeed);
        let old = ActionLock {
            description: "Pending action: CREATE".to_string(),
            acquired_at: Utc::now().timestamp() - 10_000,
        };
        fx.broker
            .set_nx(&lock_key(1), &serde_json::to_string(&old).unwrap(), None)
            .await
            .unwrap();
        fx.dispatcher
            .do_action_async("Scripted", 2, "create", None)
            .await
            .unwrap();

        let released = fx
            .dispatcher
            .release_stale_locks(Duration::from_secs(7200))
            .await
            .unwrap();

        assert_eq!(released, 1);
        assert_eq!(fx.broker.get(&lock_key(1)).await.unwrap(), None);
        assert!(fx.broker.get(&lock_key(2)).await.unwrap().is_some());
    }
}
