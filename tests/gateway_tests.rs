//! End-to-end scenarios against scripted provider clients.
//!
//! Every test wires real schedulers, balancers, health trackers, and
//! blacklists; only the outbound HTTP call is mocked.

use futures::StreamExt;
use model_relay::config::{
    AuthConfig, AuthKind, BalancerStrategy, CircuitBreakerConfig, ProviderConfig, SchedulerConfig,
    Target,
};
use model_relay::stages::llm_switch::{LlmSwitchConfig, Protocol};
use model_relay::stages::provider::ProviderStageConfig;
use model_relay::stages::workflow::WorkflowConfig;
use model_relay::stages::CompatibilityConfig;
use model_relay::table::{PipelineConfig, StageConfigSet};
use model_relay::{
    ExecutionStatus, GatewayRequest, MockOutcome, MockProviderClient, PipelineInstance,
    ProviderClient, RetryBackoff, SchedulerManager, VmScheduler,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn pipeline_config(vm: &str, provider_id: &str, weight: u32) -> PipelineConfig {
    PipelineConfig {
        pipeline_id: format!("{vm}:{provider_id}:m1:0"),
        virtual_model: vm.to_string(),
        target: Target {
            provider_id: provider_id.to_string(),
            model_id: "m1".to_string(),
            key_index: 0,
            weight,
            enabled: true,
        },
        provider: ProviderConfig {
            provider_id: provider_id.to_string(),
            provider_type: "openai".to_string(),
            endpoint: format!("https://{provider_id}.example.com"),
            auth: AuthConfig {
                kind: AuthKind::ApiKey,
                keys: vec!["k".to_string()],
            },
            models: HashMap::new(),
        },
        stages: StageConfigSet {
            llm_switch: LlmSwitchConfig::passthrough(Protocol::OpenaiChat),
            workflow: WorkflowConfig::default(),
            compatibility: CompatibilityConfig {
                provider_type: "openai".to_string(),
            },
            provider: ProviderStageConfig {
                provider_id: provider_id.to_string(),
                provider_type: "openai".to_string(),
                model_id: "m1".to_string(),
                key_index: 0,
                timeout: Duration::from_secs(5),
            },
        },
    }
}

fn instance_with(
    vm: &str,
    provider_id: &str,
    weight: u32,
    outcomes: Vec<MockOutcome>,
) -> (Arc<PipelineInstance>, Arc<MockProviderClient>) {
    let client = Arc::new(MockProviderClient::new(provider_id, outcomes));
    let instance = Arc::new(
        PipelineInstance::with_provider_client(
            pipeline_config(vm, provider_id, weight),
            Arc::clone(&client) as Arc<dyn ProviderClient>,
        )
        .unwrap(),
    );
    (instance, client)
}

fn scheduler_config(strategy: BalancerStrategy, max_retries: u32) -> SchedulerConfig {
    SchedulerConfig {
        max_retries,
        default_timeout_ms: 5_000,
        max_concurrent_requests: 64,
        load_balancer: model_relay::config::LoadBalancerConfig {
            strategy,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 1_000,
                recovery_time_ms: 60_000,
                request_volume_threshold: 1,
                rolling_window_ms: 60_000,
            },
            ..Default::default()
        },
        blacklist_sweep_interval_ms: 50,
    }
}

fn request(body: Value) -> GatewayRequest {
    GatewayRequest::new("req", body)
}

fn chat_body() -> Value {
    json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]})
}

fn ok_body() -> Value {
    json!({"choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"},
                        "finish_reason": "stop"}]})
}

// --- Scenario: happy path under the weighted balancer ----------------------

#[tokio::test]
async fn weighted_balancer_distributes_seventy_thirty() {
    let (a, client_a) = instance_with("gpt-proxy", "a", 70, vec![MockOutcome::Success(ok_body())]);
    let (b, client_b) = instance_with("gpt-proxy", "b", 30, vec![MockOutcome::Success(ok_body())]);
    let scheduler = VmScheduler::with_instances(
        "gpt-proxy",
        vec![Arc::clone(&a), Arc::clone(&b)],
        scheduler_config(BalancerStrategy::Weighted, 0),
        None,
    )
    .unwrap();

    for _ in 0..100 {
        let result = scheduler
            .handle_request(request(chat_body()), CancellationToken::new())
            .await;
        assert_eq!(result.status, ExecutionStatus::Completed);
    }

    assert!((client_a.calls() as i64 - 70).abs() <= 1, "a: {}", client_a.calls());
    assert!((client_b.calls() as i64 - 30).abs() <= 1, "b: {}", client_b.calls());
    assert_eq!(a.stats().successes() + b.stats().successes(), 100);
    assert_eq!(a.stats().failures(), 0);
    assert_eq!(b.stats().failures(), 0);
    // Quiescent: nothing left in flight.
    assert_eq!(scheduler.in_flight(), 0);
}

#[tokio::test]
async fn round_robin_is_fair_over_a_window() {
    let mut instances = Vec::new();
    let mut clients = Vec::new();
    for name in ["a", "b", "c"] {
        let (i, c) = instance_with("vm", name, 1, vec![MockOutcome::Success(ok_body())]);
        instances.push(i);
        clients.push(c);
    }
    let scheduler = VmScheduler::with_instances(
        "vm",
        instances,
        scheduler_config(BalancerStrategy::RoundRobin, 0),
        None,
    )
    .unwrap();

    for _ in 0..30 {
        scheduler
            .handle_request(request(chat_body()), CancellationToken::new())
            .await;
    }
    for client in &clients {
        assert_eq!(client.calls(), 10);
    }
}

// --- Scenario: failover on 5xx ---------------------------------------------

#[tokio::test]
async fn failover_on_server_error_succeeds_on_second_instance() {
    let (a, client_a) = instance_with(
        "vm",
        "a",
        1,
        vec![MockOutcome::Status {
            status: 502,
            body: "bad gateway".into(),
            retry_after: None,
        }],
    );
    let (b, client_b) = instance_with("vm", "b", 1, vec![MockOutcome::Success(ok_body())]);
    let scheduler = VmScheduler::with_instances(
        "vm",
        vec![Arc::clone(&a), Arc::clone(&b)],
        scheduler_config(BalancerStrategy::RoundRobin, 0),
        None,
    )
    .unwrap()
    .with_backoff(RetryBackoff::none());

    let result = scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(client_a.calls(), 1);
    assert_eq!(client_b.calls(), 1);
    assert_eq!(a.stats().consecutive_failures(), 1);
    assert_eq!(b.stats().successes(), 1);
}

#[tokio::test]
async fn transient_error_retries_same_instance_before_failover() {
    let (a, client_a) = instance_with(
        "vm",
        "a",
        1,
        vec![
            MockOutcome::Status {
                status: 503,
                body: "hiccup".into(),
                retry_after: None,
            },
            MockOutcome::Success(ok_body()),
        ],
    );
    let (_b, client_b) = instance_with("vm", "b", 1, vec![MockOutcome::Success(ok_body())]);
    let scheduler = VmScheduler::with_instances(
        "vm",
        vec![a, _b],
        scheduler_config(BalancerStrategy::RoundRobin, 1),
        None,
    )
    .unwrap()
    .with_backoff(RetryBackoff::none());

    let result = scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    // Both calls landed on the same instance; the healthy peer was never hit.
    assert_eq!(client_a.calls(), 2);
    assert_eq!(client_b.calls(), 0);
}

#[tokio::test]
async fn max_retries_zero_aborts_on_first_failure_with_single_target() {
    let (a, client_a) = instance_with(
        "vm",
        "a",
        1,
        vec![MockOutcome::Status {
            status: 500,
            body: "boom".into(),
            retry_after: None,
        }],
    );
    let scheduler = VmScheduler::with_instances(
        "vm",
        vec![a],
        scheduler_config(BalancerStrategy::RoundRobin, 0),
        None,
    )
    .unwrap()
    .with_backoff(RetryBackoff::none());

    let result = scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(client_a.calls(), 1);
    assert_eq!(
        result.error.unwrap()["error"]["code"],
        "PROVIDER_SERVER_ERROR"
    );
}

// --- Scenario: circuit breaker ---------------------------------------------

fn breaker_config(failure_threshold: u32, recovery_ms: u64) -> SchedulerConfig {
    SchedulerConfig {
        load_balancer: model_relay::config::LoadBalancerConfig {
            strategy: BalancerStrategy::RoundRobin,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold,
                recovery_time_ms: recovery_ms,
                request_volume_threshold: 1,
                rolling_window_ms: 60_000,
            },
            ..Default::default()
        },
        ..scheduler_config(BalancerStrategy::RoundRobin, 0)
    }
}

#[tokio::test]
async fn circuit_opens_after_threshold_and_recovers_through_probe() {
    let (a, client_a) = instance_with(
        "vm",
        "a",
        1,
        vec![
            MockOutcome::Network,
            MockOutcome::Network,
            MockOutcome::Network,
            MockOutcome::Success(ok_body()),
        ],
    );
    let scheduler = VmScheduler::with_instances(
        "vm",
        vec![a],
        breaker_config(3, 100),
        None,
    )
    .unwrap()
    .with_backoff(RetryBackoff::none());

    // Three failing requests trip the breaker.
    for _ in 0..3 {
        let result = scheduler
            .handle_request(request(chat_body()), CancellationToken::new())
            .await;
        assert_eq!(result.status, ExecutionStatus::Failed);
    }
    assert_eq!(client_a.calls(), 3);

    // While open, the instance is skipped entirely.
    let result = scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;
    assert_eq!(
        result.error.unwrap()["error"]["code"],
        "NO_HEALTHY_INSTANCE"
    );
    assert_eq!(client_a.calls(), 3, "open circuit must not admit traffic");

    // After recovery time, exactly one probe goes through and closes it.
    tokio::time::sleep(Duration::from_millis(120)).await;
    let result = scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(client_a.calls(), 4);

    // Closed again: traffic flows normally.
    let result = scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;
    assert_eq!(result.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn failed_probe_reopens_circuit() {
    let (a, client_a) = instance_with(
        "vm",
        "a",
        1,
        vec![MockOutcome::Network], // repeats forever
    );
    let scheduler = VmScheduler::with_instances("vm", vec![a], breaker_config(1, 80), None)
        .unwrap()
        .with_backoff(RetryBackoff::none());

    scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;
    assert_eq!(client_a.calls(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    // The probe fails and the breaker reopens.
    scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;
    assert_eq!(client_a.calls(), 2);

    // Immediately after, no traffic is admitted.
    let result = scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;
    assert_eq!(
        result.error.unwrap()["error"]["code"],
        "NO_HEALTHY_INSTANCE"
    );
    assert_eq!(client_a.calls(), 2);
}

// --- Scenario: rate limit with Retry-After ---------------------------------

#[tokio::test]
async fn rate_limit_blacklists_for_retry_after_then_fails_over() {
    let (a, client_a) = instance_with(
        "vm",
        "a",
        1,
        vec![
            MockOutcome::Status {
                status: 429,
                body: "limited".into(),
                retry_after: Some(Duration::from_millis(150)),
            },
            MockOutcome::Success(ok_body()),
        ],
    );
    let (_b, client_b) = instance_with("vm", "b", 1, vec![MockOutcome::Success(ok_body())]);
    let scheduler = VmScheduler::with_instances(
        "vm",
        vec![a, _b],
        scheduler_config(BalancerStrategy::RoundRobin, 2),
        None,
    )
    .unwrap()
    .with_backoff(RetryBackoff::none());

    // Rate limit: no same-instance retry, immediate failover to b.
    let result = scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(client_a.calls(), 1);
    assert_eq!(client_b.calls(), 1);

    // While blacklisted, a is invisible: the next request goes to b too.
    let result = scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(client_a.calls(), 1);
    assert_eq!(client_b.calls(), 2);

    // After the Retry-After window, a serves again.
    tokio::time::sleep(Duration::from_millis(170)).await;
    let mut a_served = false;
    for _ in 0..4 {
        scheduler
            .handle_request(request(chat_body()), CancellationToken::new())
            .await;
        if client_a.calls() > 1 {
            a_served = true;
            break;
        }
    }
    assert!(a_served, "instance a should rejoin after blacklist expiry");
}

#[tokio::test]
async fn rate_limit_with_no_alternative_empties_the_pool() {
    let (a, _client_a) = instance_with(
        "vm",
        "a",
        1,
        vec![MockOutcome::Status {
            status: 429,
            body: "limited".into(),
            retry_after: Some(Duration::from_secs(2)),
        }],
    );
    let scheduler = VmScheduler::with_instances(
        "vm",
        vec![a],
        scheduler_config(BalancerStrategy::RoundRobin, 2),
        None,
    )
    .unwrap()
    .with_backoff(RetryBackoff::none());

    // The failing request surfaces the real cause.
    let result = scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;
    assert_eq!(
        result.error.unwrap()["error"]["code"],
        "PROVIDER_RATE_LIMIT"
    );

    // Subsequent requests inside the window find an empty pool.
    let result = scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;
    assert_eq!(
        result.error.unwrap()["error"]["code"],
        "NO_HEALTHY_INSTANCE"
    );
}

// --- Scenario: auth failures blacklist long --------------------------------

#[tokio::test]
async fn auth_failure_blacklists_and_fails_over() {
    let (a, client_a) = instance_with(
        "vm",
        "a",
        1,
        vec![MockOutcome::Status {
            status: 401,
            body: "bad key".into(),
            retry_after: None,
        }],
    );
    let (_b, client_b) = instance_with("vm", "b", 1, vec![MockOutcome::Success(ok_body())]);
    let scheduler = VmScheduler::with_instances(
        "vm",
        vec![Arc::clone(&a), _b],
        scheduler_config(BalancerStrategy::RoundRobin, 2),
        None,
    )
    .unwrap()
    .with_backoff(RetryBackoff::none());

    let result = scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(client_a.calls(), 1);
    assert_eq!(client_b.calls(), 1);

    let metrics = scheduler.metrics();
    assert_eq!(metrics.blacklist.len(), 1);
    assert_eq!(metrics.blacklist[0].instance_id, a.id());

    // Admin clears the entry; a is routable again.
    assert!(scheduler.unblacklist_instance(a.id()));
    assert!(scheduler.metrics().blacklist.is_empty());
}

// --- Scenario: cancellation propagation ------------------------------------

#[tokio::test]
async fn cancellation_mid_call_leaves_health_untouched() {
    let (a, _client) = instance_with("vm", "a", 1, vec![MockOutcome::Hang]);
    let scheduler = Arc::new(
        VmScheduler::with_instances(
            "vm",
            vec![Arc::clone(&a)],
            scheduler_config(BalancerStrategy::RoundRobin, 2),
            None,
        )
        .unwrap(),
    );

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        async move {
            scheduler
                .handle_request(request(chat_body()), cancel)
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let result = task.await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert_eq!(result.error.as_ref().unwrap()["error"]["code"], "CANCELLED");
    assert_eq!(result.error.as_ref().unwrap()["error"]["httpStatus"], 499);
    // Cancellation is not a provider failure.
    assert_eq!(a.stats().requests(), 0);
    assert_eq!(a.stats().failures(), 0);
    assert_eq!(scheduler.in_flight(), 0);
}

// --- Scenario: timeout ------------------------------------------------------

#[tokio::test]
async fn deadline_produces_timeout_result() {
    let client = Arc::new(
        MockProviderClient::new("slow", vec![MockOutcome::Success(ok_body())])
            .with_delay(Duration::from_millis(500)),
    );
    let instance = Arc::new(
        PipelineInstance::with_provider_client(pipeline_config("vm", "slow", 1), client).unwrap(),
    );
    let config = SchedulerConfig {
        default_timeout_ms: 50,
        ..scheduler_config(BalancerStrategy::RoundRobin, 2)
    };
    let scheduler = VmScheduler::with_instances("vm", vec![instance], config, None)
        .unwrap()
        .with_backoff(RetryBackoff::none());

    let result = scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;
    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert_eq!(result.error.unwrap()["error"]["code"], "TIMEOUT");
}

// --- Scenario: backpressure -------------------------------------------------

#[tokio::test]
async fn concurrency_cap_rejects_overflow_immediately() {
    let (a, _client) = instance_with("vm", "a", 1, vec![MockOutcome::Hang]);
    let config = SchedulerConfig {
        max_concurrent_requests: 1,
        ..scheduler_config(BalancerStrategy::RoundRobin, 0)
    };
    let scheduler = Arc::new(VmScheduler::with_instances("vm", vec![a], config, None).unwrap());

    let cancel = CancellationToken::new();
    let blocked = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        async move { scheduler.handle_request(request(chat_body()), cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let result = scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;
    assert_eq!(
        result.error.unwrap()["error"]["code"],
        "BACKPRESSURE_REJECTED"
    );

    cancel.cancel();
    blocked.await.unwrap();
}

// --- Scenario: empty provider body is success -------------------------------

#[tokio::test]
async fn empty_provider_body_passes_through_as_success() {
    let (a, _client) = instance_with("vm", "a", 1, vec![MockOutcome::Success(json!({}))]);
    let scheduler = VmScheduler::with_instances(
        "vm",
        vec![a],
        scheduler_config(BalancerStrategy::RoundRobin, 0),
        None,
    )
    .unwrap();

    let result = scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.body.unwrap(), json!({}));
}

// --- Scenario: zero targets rejected ----------------------------------------

#[tokio::test]
async fn empty_instance_set_is_rejected_at_registration() {
    let err = VmScheduler::with_instances(
        "vm",
        Vec::new(),
        scheduler_config(BalancerStrategy::RoundRobin, 0),
        None,
    )
    .unwrap_err();
    assert_eq!(err.code(), "STAGE_CONFIG_INVALID");
}

// --- Manager-level scenarios -------------------------------------------------

fn manager_with_scheduler(scheduler: VmScheduler) -> SchedulerManager {
    let manager = SchedulerManager::new(model_relay::GatewayConfig {
        providers: HashMap::new(),
        virtual_models: Vec::new(),
        scheduler: SchedulerConfig::default(),
        client_protocol: "openai".to_string(),
    })
    .unwrap();
    manager.register_scheduler(Arc::new(scheduler));
    manager
}

#[tokio::test]
async fn unknown_virtual_model_is_rejected_without_side_effects() {
    let (a, client_a) = instance_with("vm", "a", 1, vec![MockOutcome::Success(ok_body())]);
    let scheduler = VmScheduler::with_instances(
        "vm",
        vec![a],
        scheduler_config(BalancerStrategy::RoundRobin, 0),
        None,
    )
    .unwrap();
    let manager = manager_with_scheduler(scheduler);

    let result = manager
        .dispatch("nonexistent", request(chat_body()), CancellationToken::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    let error = result.error.unwrap();
    assert_eq!(error["error"]["code"], "UNKNOWN_VIRTUAL_MODEL");
    assert_eq!(error["error"]["httpStatus"], 404);
    // No instance was consulted.
    assert_eq!(client_a.calls(), 0);
}

#[tokio::test]
async fn dispatch_routes_to_owning_scheduler() {
    let (a, _client) = instance_with("vm", "a", 1, vec![MockOutcome::Success(ok_body())]);
    let scheduler = VmScheduler::with_instances(
        "vm",
        vec![a],
        scheduler_config(BalancerStrategy::RoundRobin, 0),
        None,
    )
    .unwrap();
    let manager = manager_with_scheduler(scheduler);

    let result = manager
        .dispatch("vm", request(chat_body()), CancellationToken::new())
        .await;
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(result.body.is_some());
}

#[tokio::test]
async fn streaming_dispatch_delivers_chunks() {
    let chunks = vec![
        json!({"choices": [{"delta": {"content": "he"}, "finish_reason": null}]}),
        json!({"choices": [{"delta": {"content": "y"}, "finish_reason": "stop"}]}),
    ];
    let (a, _client) = instance_with("vm", "a", 1, vec![MockOutcome::Stream(chunks)]);
    let scheduler = VmScheduler::with_instances(
        "vm",
        vec![a],
        scheduler_config(BalancerStrategy::RoundRobin, 0),
        None,
    )
    .unwrap();
    let manager = manager_with_scheduler(scheduler);

    let stream = manager
        .dispatch_stream(
            "vm",
            request(json!({"model": "m", "stream": true, "messages": []})),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let collected: Vec<Value> = stream.map(|c| c.unwrap()).collect().await;
    let text: String = collected
        .iter()
        .filter_map(|c| c.pointer("/choices/0/delta/content").and_then(Value::as_str))
        .collect();
    assert_eq!(text, "hey");
}

#[tokio::test]
async fn streaming_failover_before_first_chunk() {
    let (a, client_a) = instance_with("vm", "a", 1, vec![MockOutcome::Network]);
    let chunks = vec![json!({"choices": [{"delta": {"content": "ok"}, "finish_reason": "stop"}]})];
    let (_b, client_b) = instance_with("vm", "b", 1, vec![MockOutcome::Stream(chunks)]);
    let scheduler = VmScheduler::with_instances(
        "vm",
        vec![a, _b],
        scheduler_config(BalancerStrategy::RoundRobin, 0),
        None,
    )
    .unwrap()
    .with_backoff(RetryBackoff::none());
    let manager = manager_with_scheduler(scheduler);

    let stream = manager
        .dispatch_stream(
            "vm",
            request(json!({"model": "m", "stream": true, "messages": []})),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let collected: Vec<_> = stream.collect().await;
    assert_eq!(collected.len(), 1);
    assert_eq!(client_a.calls(), 1);
    assert_eq!(client_b.calls(), 1);
}

#[tokio::test]
async fn shutdown_drains_then_rejects() {
    let client = Arc::new(
        MockProviderClient::new("slow", vec![MockOutcome::Success(ok_body())])
            .with_delay(Duration::from_millis(100)),
    );
    let instance = Arc::new(
        PipelineInstance::with_provider_client(pipeline_config("vm", "slow", 1), client).unwrap(),
    );
    let scheduler = VmScheduler::with_instances(
        "vm",
        vec![instance],
        scheduler_config(BalancerStrategy::RoundRobin, 0),
        None,
    )
    .unwrap();
    let manager = Arc::new(manager_with_scheduler(scheduler));

    // A slow request in flight while shutdown begins.
    let in_flight = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move {
            manager
                .dispatch("vm", request(chat_body()), CancellationToken::new())
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    manager.shutdown(Duration::from_secs(2)).await;

    // The in-flight request drained to completion.
    let result = in_flight.await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);

    // New work is rejected.
    let result = manager
        .dispatch("vm", request(chat_body()), CancellationToken::new())
        .await;
    assert_eq!(
        result.error.unwrap()["error"]["code"],
        "NO_HEALTHY_INSTANCE"
    );
}

#[tokio::test]
async fn start_and_reload_rebuild_the_scheduler_set() {
    use model_relay::config::{GatewayConfig, ModelInfo, VirtualModelConfig};
    use std::collections::BTreeSet;

    fn full_config(vm_ids: &[&str]) -> GatewayConfig {
        let mut models = HashMap::new();
        models.insert(
            "m1".to_string(),
            ModelInfo {
                context_length: 8192,
                max_tokens: 1024,
                capabilities: BTreeSet::new(),
            },
        );
        let provider = ProviderConfig {
            provider_id: "p1".to_string(),
            provider_type: "openai".to_string(),
            endpoint: "https://p1.example.com".to_string(),
            auth: AuthConfig {
                kind: AuthKind::ApiKey,
                keys: vec!["k".to_string()],
            },
            models,
        };
        GatewayConfig {
            providers: [("p1".to_string(), provider)].into_iter().collect(),
            virtual_models: vm_ids
                .iter()
                .map(|id| VirtualModelConfig {
                    id: id.to_string(),
                    enabled: true,
                    priority: 0,
                    targets: vec![Target {
                        provider_id: "p1".to_string(),
                        model_id: "m1".to_string(),
                        key_index: 0,
                        weight: 1,
                        enabled: true,
                    }],
                    capabilities: BTreeSet::new(),
                })
                .collect(),
            scheduler: SchedulerConfig::default(),
            client_protocol: "openai".to_string(),
        }
    }

    let manager = SchedulerManager::new(full_config(&["vm-a", "vm-b"])).unwrap();
    manager.start().unwrap();
    let mut vms = manager.virtual_models();
    vms.sort();
    assert_eq!(vms, vec!["vm-a", "vm-b"]);

    // Reload drops vm-b and adds vm-c.
    manager.reload(full_config(&["vm-a", "vm-c"])).unwrap();
    let mut vms = manager.virtual_models();
    vms.sort();
    assert_eq!(vms, vec!["vm-a", "vm-c"]);

    // A bad config never replaces the running table.
    let mut broken = full_config(&["vm-a"]);
    broken.virtual_models[0].targets[0].provider_id = "ghost".to_string();
    assert!(manager.reload(broken).is_err());
    let mut vms = manager.virtual_models();
    vms.sort();
    assert_eq!(vms, vec!["vm-a", "vm-c"]);
}

#[tokio::test]
async fn metrics_reflect_outcomes() {
    let (a, _client) = instance_with(
        "vm",
        "a",
        1,
        vec![
            MockOutcome::Success(ok_body()),
            MockOutcome::Status {
                status: 500,
                body: "boom".into(),
                retry_after: None,
            },
        ],
    );
    let scheduler = VmScheduler::with_instances(
        "vm",
        vec![a],
        scheduler_config(BalancerStrategy::RoundRobin, 0),
        None,
    )
    .unwrap()
    .with_backoff(RetryBackoff::none());

    scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;
    scheduler
        .handle_request(request(chat_body()), CancellationToken::new())
        .await;

    let metrics = scheduler.metrics();
    assert_eq!(metrics.virtual_model, "vm");
    assert_eq!(metrics.instances.len(), 1);
    let stats = &metrics.instances[0].stats;
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.current_in_flight, 0);
}
