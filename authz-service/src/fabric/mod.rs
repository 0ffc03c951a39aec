//! Message fabric.
//!
//! Typed request/reply and fire-and-forget publish between the coordinator
//! and the handlers that touch the persistence layer. The client side adds
//! per-message circuit breaking and deadlines; the consumer side adds
//! bounded concurrency, retry with exponential backoff, and a dead-letter
//! sink for persistent failures.

pub mod handlers;
pub mod messages;
pub mod rabbitmq;
pub mod transport;

use authz_core::breaker::{BreakerConfig, CircuitBreaker};
use authz_core::error::AuthzError;
use authz_core::retry::{is_retryable, retry_call, RetryConfig};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::FabricSettings;
use crate::fabric::handlers::HandlerRegistry;
use crate::fabric::messages::{Envelope, FabricEvent, FabricMessage, ReplyEnvelope, WireFailure};
use crate::fabric::transport::{Delivery, Transport};
use crate::services::database::Database;

/// Client/consumer tuning for the fabric.
#[derive(Clone)]
pub struct FabricConfig {
    pub call_timeout: Duration,
    pub concurrency: usize,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
}

impl FabricConfig {
    pub fn from_settings(settings: &FabricSettings) -> Self {
        Self {
            call_timeout: settings.call_timeout(),
            concurrency: settings.concurrency,
            retry: RetryConfig {
                max_retries: settings.retry_limit,
                initial_backoff: Duration::from_secs(settings.retry_initial_seconds),
                max_backoff: Duration::from_secs(settings.retry_max_seconds),
                backoff_multiplier: settings.retry_multiplier,
                add_jitter: true,
            },
            breaker: BreakerConfig {
                trip_threshold: settings.breaker_trip,
                window: Duration::from_secs(settings.breaker_window_seconds),
                reset: Duration::from_secs(settings.breaker_reset_seconds),
            },
        }
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            concurrency: 32,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// A message that exhausted its retries, kept for inspection.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub queue: String,
    pub payload: Vec<u8>,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Bounded in-process dead-letter buffer. Every push is also logged.
#[derive(Clone)]
pub struct DeadLetterSink {
    entries: Arc<Mutex<VecDeque<DeadLetter>>>,
    capacity: usize,
}

impl DeadLetterSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, letter: DeadLetter) {
        tracing::error!(
            queue = %letter.queue,
            error = %letter.error,
            "message dead-lettered"
        );
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(letter);
    }

    pub fn recent(&self) -> Vec<DeadLetter> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Client handle for issuing fabric calls.
pub struct Fabric {
    transport: Arc<dyn Transport>,
    config: FabricConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Fabric {
    pub fn new(transport: Arc<dyn Transport>, config: FabricConfig) -> Self {
        Self {
            transport,
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    fn breaker_for(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().unwrap().get(name) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.breaker.clone())))
            .clone()
    }

    /// Typed request/reply without caller-side cancellation.
    pub async fn request<M: FabricMessage>(&self, message: M) -> Result<M::Response, AuthzError> {
        self.request_with_cancel(message, &CancellationToken::new())
            .await
    }

    /// Typed request/reply. The call suspends until a reply arrives, the
    /// per-call deadline elapses, or `cancel` fires; a cancelled caller stops
    /// waiting and the in-flight handler result is discarded.
    pub async fn request_with_cancel<M: FabricMessage>(
        &self,
        message: M,
        cancel: &CancellationToken,
    ) -> Result<M::Response, AuthzError> {
        let breaker = self.breaker_for(M::NAME);
        if !breaker.try_acquire() {
            return Err(AuthzError::ServiceUnavailable);
        }

        let envelope = Envelope {
            correlation_id: Uuid::new_v4(),
            message: M::NAME.to_string(),
            payload: serde_json::to_value(&message)?,
        };
        let bytes = serde_json::to_vec(&envelope)?;

        let transport_result = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AuthzError::ConsumeFailed(anyhow::anyhow!(
                    "call to {} cancelled by caller",
                    M::NAME
                )));
            }
            result = self.transport.request(M::NAME, bytes, self.config.call_timeout) => result,
        };

        let reply_bytes = match transport_result {
            Ok(bytes) => {
                breaker.record_success();
                bytes
            }
            Err(e) => {
                breaker.record_failure();
                return Err(e);
            }
        };

        let reply: ReplyEnvelope = serde_json::from_slice(&reply_bytes)?;
        if reply.correlation_id != envelope.correlation_id {
            return Err(AuthzError::ConsumeFailed(anyhow::anyhow!(
                "correlation id mismatch on {}",
                M::NAME
            )));
        }

        if let Some(failure) = reply.err {
            return Err(AuthzError::from_wire(failure.code, failure.message));
        }

        let ok = reply.ok.ok_or_else(|| {
            AuthzError::ConsumeFailed(anyhow::anyhow!("reply carries neither ok nor err"))
        })?;
        Ok(serde_json::from_value(ok)?)
    }

    /// Fire-and-forget publish; resolves once the transport has accepted the
    /// message.
    pub async fn publish<E: FabricEvent>(&self, event: E) -> Result<(), AuthzError> {
        let envelope = Envelope {
            correlation_id: Uuid::new_v4(),
            message: E::NAME.to_string(),
            payload: serde_json::to_value(&event)?,
        };
        self.transport
            .publish(E::NAME, serde_json::to_vec(&envelope)?)
            .await
    }
}

/// Consumer side: one subscription per registered message, a shared
/// concurrency budget, retry, and dead-lettering.
pub struct FabricConsumer {
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    db: Database,
    config: FabricConfig,
    dead_letters: DeadLetterSink,
    shutdown: CancellationToken,
}

impl FabricConsumer {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<HandlerRegistry>,
        db: Database,
        config: FabricConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            registry,
            db,
            config,
            dead_letters: DeadLetterSink::new(256),
            shutdown,
        }
    }

    pub fn dead_letters(&self) -> DeadLetterSink {
        self.dead_letters.clone()
    }

    /// Subscribe every registered handler and start its consume loop.
    pub async fn start(&self) -> Result<(), AuthzError> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));

        for name in self.registry.names() {
            let mut rx = self.transport.subscribe(name).await?;
            let registry = self.registry.clone();
            let db = self.db.clone();
            let retry = self.config.retry.clone();
            let dead_letters = self.dead_letters.clone();
            let shutdown = self.shutdown.clone();
            let semaphore = semaphore.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        delivery = rx.recv() => {
                            let Some(delivery) = delivery else { break };
                            let permit = match semaphore.clone().acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => break,
                            };
                            let registry = registry.clone();
                            let db = db.clone();
                            let retry = retry.clone();
                            let dead_letters = dead_letters.clone();
                            tokio::spawn(async move {
                                let _permit = permit;
                                handle_delivery(name, delivery, registry, db, retry, dead_letters)
                                    .await;
                            });
                        }
                    }
                }
                tracing::info!(queue = name, "fabric consumer stopped");
            });
        }

        Ok(())
    }
}

async fn handle_delivery(
    queue: &'static str,
    delivery: Delivery,
    registry: Arc<HandlerRegistry>,
    db: Database,
    retry: RetryConfig,
    dead_letters: DeadLetterSink,
) {
    let envelope: Envelope = match serde_json::from_slice(&delivery.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            dead_letters.push(DeadLetter {
                queue: queue.to_string(),
                payload: delivery.payload,
                error: format!("malformed envelope: {}", e),
                failed_at: Utc::now(),
            });
            if let Some(reply_tx) = delivery.reply {
                let reply = ReplyEnvelope {
                    correlation_id: Uuid::nil(),
                    ok: None,
                    err: Some(WireFailure {
                        code: AuthzError::SerializationFailed(anyhow::anyhow!("")).code(),
                        message: format!("malformed envelope: {}", e),
                    }),
                };
                let _ = reply_tx.send(serde_json::to_vec(&reply).unwrap_or_default());
            }
            return;
        }
    };

    let result = match registry.get(&envelope.message) {
        None => Err(AuthzError::ConsumeFailed(anyhow::anyhow!(
            "no handler registered for {}",
            envelope.message
        ))),
        Some(handler) => {
            retry_call(&retry, &envelope.message, || {
                handler.call(envelope.payload.clone(), db.clone())
            })
            .await
        }
    };

    // Business failures are legitimate typed replies; only transport-class
    // and retry-exhausted failures are dead-lettered.
    if let Err(err) = &result {
        if is_retryable(err)
            || matches!(
                err,
                AuthzError::SerializationFailed(_) | AuthzError::ConsumeFailed(_)
            )
        {
            dead_letters.push(DeadLetter {
                queue: queue.to_string(),
                payload: serde_json::to_vec(&envelope).unwrap_or_default(),
                error: err.to_string(),
                failed_at: Utc::now(),
            });
        }
    }

    if let Some(reply_tx) = delivery.reply {
        let reply = match result {
            Ok(value) => ReplyEnvelope {
                correlation_id: envelope.correlation_id,
                ok: Some(value),
                err: None,
            },
            Err(e) => ReplyEnvelope {
                correlation_id: envelope.correlation_id,
                ok: None,
                err: Some(WireFailure {
                    code: e.code(),
                    message: e.to_string(),
                }),
            },
        };
        let _ = reply_tx.send(serde_json::to_vec(&reply).unwrap_or_default());
    } else if let Err(e) = result {
        tracing::error!(queue = queue, error = %e, "event handler failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::transport::InMemoryTransport;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct EchoReply {
        text: String,
    }

    impl FabricMessage for Echo {
        const NAME: &'static str = "test.echo";
        type Response = EchoReply;
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Fail {
        transient: bool,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct FailReply;

    impl FabricMessage for Fail {
        const NAME: &'static str = "test.fail";
        type Response = FailReply;
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Tick;

    impl FabricEvent for Tick {
        const NAME: &'static str = "test.tick";
    }

    fn test_db() -> Database {
        // Never connected; test handlers don't touch the database.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/fabric_test_unused")
            .unwrap();
        Database::new(pool)
    }

    fn quick_config() -> FabricConfig {
        FabricConfig {
            call_timeout: Duration::from_millis(200),
            concurrency: 8,
            retry: RetryConfig::quick(),
            breaker: BreakerConfig {
                trip_threshold: 3,
                window: Duration::from_secs(60),
                reset: Duration::from_secs(300),
            },
        }
    }

    async fn start_consumer(registry: HandlerRegistry) -> (Fabric, FabricConsumer) {
        let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new(64));
        let consumer = FabricConsumer::new(
            transport.clone(),
            Arc::new(registry),
            test_db(),
            quick_config(),
            CancellationToken::new(),
        );
        consumer.start().await.unwrap();
        (Fabric::new(transport, quick_config()), consumer)
    }

    #[tokio::test]
    async fn test_typed_request_reply() {
        let mut registry = HandlerRegistry::new();
        registry.register(|req: Echo, _db: Database| async move {
            Ok(EchoReply { text: req.text })
        });

        let (fabric, _consumer) = start_consumer(registry).await;
        let reply = fabric
            .request(Echo {
                text: "hello".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(reply.text, "hello");
    }

    #[tokio::test]
    async fn test_business_failure_crosses_wire_with_family() {
        let mut registry = HandlerRegistry::new();
        registry.register(|_req: Fail, _db: Database| async move {
            Err::<FailReply, _>(AuthzError::UserNotFound)
        });

        let (fabric, consumer) = start_consumer(registry).await;
        let err = fabric.request(Fail { transient: false }).await.unwrap_err();
        assert_eq!(err.code(), AuthzError::UserNotFound.code());
        // Business outcomes are not dead-lettered.
        assert!(consumer.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_retried_then_dead_lettered() {
        static CALLS: AtomicU32 = AtomicU32::new(0);

        let mut registry = HandlerRegistry::new();
        registry.register(|_req: Fail, _db: Database| async move {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Err::<FailReply, _>(AuthzError::QueryFailed(anyhow::anyhow!("db down")))
        });

        let (fabric, consumer) = start_consumer(registry).await;
        let err = fabric.request(Fail { transient: true }).await.unwrap_err();
        assert_eq!(
            err.code(),
            AuthzError::QueryFailed(anyhow::anyhow!("")).code()
        );
        // Initial attempt + 2 quick retries.
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);
        assert_eq!(consumer.dead_letters().len(), 1);
        assert_eq!(consumer.dead_letters().recent()[0].queue, "test.fail");
    }

    #[tokio::test]
    async fn test_timeout_and_breaker_fail_fast() {
        let mut registry = HandlerRegistry::new();
        registry.register(|req: Echo, _db: Database| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(EchoReply { text: req.text })
        });

        let (fabric, _consumer) = start_consumer(registry).await;

        for _ in 0..3 {
            let err = fabric
                .request(Echo {
                    text: "slow".to_string(),
                })
                .await
                .unwrap_err();
            assert!(matches!(err, AuthzError::Timeout));
        }

        // Breaker tripped after three consecutive timeouts.
        let err = fabric
            .request(Echo {
                text: "fast-fail".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::ServiceUnavailable));
    }

    #[tokio::test]
    async fn test_cancellation_stops_waiting() {
        let mut registry = HandlerRegistry::new();
        registry.register(|req: Echo, _db: Database| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(EchoReply { text: req.text })
        });

        let (fabric, _consumer) = start_consumer(registry).await;
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = fabric
            .request_with_cancel(
                Echo {
                    text: "cancelled".to_string(),
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::ConsumeFailed(_)));
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_publish_reaches_event_handler() {
        static TICKS: AtomicU32 = AtomicU32::new(0);

        let mut registry = HandlerRegistry::new();
        registry.register_event(|_event: Tick, _db: Database| async move {
            TICKS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (fabric, _consumer) = start_consumer(registry).await;
        fabric.publish(Tick).await.unwrap();

        // The handler runs asynchronously; give it a moment.
        for _ in 0..50 {
            if TICKS.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(TICKS.load(Ordering::SeqCst), 1);
    }
}
