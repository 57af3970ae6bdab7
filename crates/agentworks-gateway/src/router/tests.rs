//! Tests for the router module

use super::*;
use crate::byoa::ByoaCredential;
use crate::completion::{CompletionRequest, CompletionResponse, TokenUsage};
use crate::error::Error;
use crate::message::Message;
use crate::pricing::PricingTable;
use crate::registry::ProviderRegistry;
use crate::stream::StreamToken;
use agentworks_metering::{MemoryMeterStore, MeterStore, UsageTracker};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

fn mock_response(model: &str, input: u32, output: u32) -> CompletionResponse {
    CompletionResponse {
        content: "Hello!".to_string(),
        tool_calls: vec![],
        usage: TokenUsage::exact(input, output),
        finish_reason: Some("stop".to_string()),
        model: model.to_string(),
    }
}

fn simple_request() -> RouteRequest {
    RouteRequest::new(
        "ws1",
        CompletionRequest::new("gpt-4o").with_message(Message::user("hi")),
    )
}

fn router_with_mock(mock: MockProvider) -> ProviderRouter {
    let mut registry = ProviderRegistry::new();
    registry.register("openai", Arc::new(mock));
    ProviderRouter::new(registry, PricingTable::new())
}

/// Usage recording is fire-and-forget; poll until the spawned task
/// lands the read-back entry (or a second passes)
async fn wait_for_last_usage(
    tracker: &UsageTracker,
    workspace: &str,
    provider: &str,
    model: &str,
) -> bool {
    for _ in 0..100 {
        if tracker.last_usage(workspace, provider, model).await.is_some() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll until a provider's failure counter resets to zero
async fn wait_for_counter_reset(tracker: &UsageTracker, provider: &str) -> bool {
    for _ in 0..100 {
        if tracker.provider_failures(provider).await == 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_unknown_provider_is_rejected_without_dispatch() {
    let router = ProviderRouter::new(ProviderRegistry::new(), PricingTable::new());

    let result = router.complete("mistral", simple_request()).await;
    assert!(matches!(result, Err(Error::UnknownProvider(name)) if name == "mistral"));

    let result = router.stream("mistral", simple_request()).await;
    assert!(matches!(result, Err(Error::UnknownProvider(_))));
}

#[tokio::test]
async fn test_completion_normalizes_usage_and_prices_from_table() {
    let mock = MockProvider::new();
    mock.add_response(mock_response("gpt-4o", 10, 5));
    let router = router_with_mock(mock);

    let result = router.complete("openai", simple_request()).await.unwrap();

    assert_eq!(result.usage.input_tokens, 10);
    assert_eq!(result.usage.output_tokens, 5);
    assert_eq!(result.usage.total_tokens, 15);
    assert_eq!(result.provider, "openai");
    assert_eq!(result.model, "gpt-4o");

    let expected = PricingTable::new().estimate("gpt-4o", 10, 5);
    assert_eq!(result.cost, expected.cost);
    assert_eq!(result.price, expected.price);
    assert!(result.cost > 0.0);
}

#[tokio::test]
async fn test_estimate_matches_completed_cost_exactly() {
    let mock = MockProvider::new();
    mock.add_response(mock_response("gpt-4o", 10, 5));
    let router = router_with_mock(mock);

    let estimate = router.estimate_cost("gpt-4o", 10, 5);
    let result = router.complete("openai", simple_request()).await.unwrap();

    // Bit-for-bit equality, not approximate
    assert_eq!(estimate.cost, result.cost);
    assert_eq!(estimate.price, result.price);
}

#[tokio::test]
async fn test_successful_completion_queues_usage_event() {
    let store: Arc<dyn MeterStore> = Arc::new(MemoryMeterStore::new());
    let tracker = Arc::new(UsageTracker::new(Some(store)));

    let mock = MockProvider::new();
    mock.add_response(mock_response("gpt-4o", 10, 5));
    let router = router_with_mock(mock).with_usage_tracker(tracker.clone());

    router.complete("openai", simple_request()).await.unwrap();

    // Recording is fire-and-forget; wait for the spawned task
    assert!(
        wait_for_last_usage(&tracker, "ws1", "openai", "gpt-4o").await
    );
    let event = tracker.last_usage("ws1", "openai", "gpt-4o").await.unwrap();
    assert_eq!(event.input_tokens, 10);
    assert!(event.cost > 0.0);
    assert!(event.latency_ms.is_some());
}

#[tokio::test]
async fn test_usage_tracking_failure_never_fails_the_request() {
    // Tracker with no backing store absorbs every write
    let tracker = Arc::new(UsageTracker::new(None));

    let mock = MockProvider::new();
    mock.add_response(mock_response("gpt-4o", 10, 5));
    let router = router_with_mock(mock).with_usage_tracker(tracker);

    let result = router.complete("openai", simple_request()).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_failures_increment_counter_and_success_resets_it() {
    let store: Arc<dyn MeterStore> = Arc::new(MemoryMeterStore::new());
    let tracker = Arc::new(UsageTracker::new(Some(store)));

    let mock = MockProvider::new();
    mock.add_error(Error::Api("boom".to_string()));
    let router = router_with_mock(mock).with_usage_tracker(tracker.clone());

    assert!(router.complete("openai", simple_request()).await.is_err());
    assert_eq!(tracker.provider_failures("openai").await, 1);

    // Default response is a success; the counter resets
    router.complete("openai", simple_request()).await.unwrap();
    assert!(wait_for_counter_reset(&tracker, "openai").await);
}

#[tokio::test]
async fn test_failure_threshold_short_circuits_deterministically() {
    let store: Arc<dyn MeterStore> = Arc::new(MemoryMeterStore::new());
    let tracker = Arc::new(UsageTracker::new(Some(store)));

    let mock = MockProvider::new();
    mock.add_error(Error::Api("boom".to_string()));
    mock.add_error(Error::Api("boom".to_string()));
    let router = router_with_mock(mock)
        .with_usage_tracker(tracker.clone())
        .with_failure_threshold(2);

    assert!(router.complete("openai", simple_request()).await.is_err());
    assert!(router.complete("openai", simple_request()).await.is_err());

    // Counter is at the threshold; dispatch is short-circuited
    let result = router.complete("openai", simple_request()).await;
    assert!(matches!(
        result,
        Err(Error::ProviderUnavailable { failures: 2, .. })
    ));

    // Short-circuiting also caches an unhealthy verdict
    let health = tracker.provider_health("openai").await.unwrap();
    assert!(!health.healthy);
}

#[tokio::test]
async fn test_without_threshold_counters_are_advisory_only() {
    let store: Arc<dyn MeterStore> = Arc::new(MemoryMeterStore::new());
    let tracker = Arc::new(UsageTracker::new(Some(store)));

    let mock = MockProvider::new();
    for _ in 0..5 {
        mock.add_error(Error::Api("boom".to_string()));
    }
    let router = router_with_mock(mock).with_usage_tracker(tracker.clone());

    for _ in 0..5 {
        assert!(matches!(
            router.complete("openai", simple_request()).await,
            Err(Error::Api(_))
        ));
    }

    // Still dispatched: default mock response succeeds
    assert!(router.complete("openai", simple_request()).await.is_ok());
}

#[tokio::test]
async fn test_byoa_result_is_never_billed() {
    let mock = MockProvider::new();
    // Large usage must still price at zero
    mock.add_response(mock_response("gpt-4o", 100_000, 50_000));

    let mock = Arc::new(mock);
    let factory_mock = mock.clone();
    let router = ProviderRouter::new(ProviderRegistry::new(), PricingTable::new())
        .with_adapter_factory(Arc::new(move |_, _| Ok(factory_mock.clone())));

    let credential = ByoaCredential {
        provider: "openai".to_string(),
        access_token: "tenant-key".to_string(),
        subscription_tier: None,
    };

    let result = router
        .complete_with_credential(&credential, &simple_request())
        .await
        .unwrap();

    assert_eq!(result.cost, 0.0);
    assert_eq!(result.price, 0.0);
    assert_eq!(result.usage.total_tokens, 150_000);
    assert_eq!(result.provider, "openai");
}

#[tokio::test]
async fn test_byoa_usage_event_carries_zero_cost() {
    let store: Arc<dyn MeterStore> = Arc::new(MemoryMeterStore::new());
    let tracker = Arc::new(UsageTracker::new(Some(store)));

    let mock = Arc::new(MockProvider::new());
    mock.add_response(mock_response("gpt-4o", 1000, 500));
    let factory_mock = mock.clone();
    let router = ProviderRouter::new(ProviderRegistry::new(), PricingTable::new())
        .with_usage_tracker(tracker.clone())
        .with_adapter_factory(Arc::new(move |_, _| Ok(factory_mock.clone())));

    let credential = ByoaCredential {
        provider: "openai".to_string(),
        access_token: "tenant-key".to_string(),
        subscription_tier: None,
    };
    router
        .complete_with_credential(&credential, &simple_request())
        .await
        .unwrap();

    assert!(
        wait_for_last_usage(&tracker, "ws1", "openai", "gpt-4o").await
    );
    let event = tracker.last_usage("ws1", "openai", "gpt-4o").await.unwrap();
    assert_eq!(event.cost, 0.0);
    assert_eq!(event.price, 0.0);
    assert_eq!(event.input_tokens, 1000);
}

#[tokio::test]
async fn test_byoa_binding_without_resolver_falls_back_to_platform() {
    let mock = MockProvider::new();
    mock.add_response(mock_response("gpt-4o", 10, 5));
    let router = router_with_mock(mock);

    let request = simple_request().with_byoa(crate::byoa::ByoaBinding::new("tenant-1"));
    let result = router.complete("openai", request).await.unwrap();

    // Platform path: normal billing applies
    assert!(result.cost > 0.0);
}

#[tokio::test]
async fn test_stream_forwards_tokens_and_records_usage() {
    let store: Arc<dyn MeterStore> = Arc::new(MemoryMeterStore::new());
    let tracker = Arc::new(UsageTracker::new(Some(store)));

    let mock = MockProvider::new();
    mock.add_stream(vec![
        StreamToken::Token {
            content: "Hel".to_string(),
        },
        StreamToken::Token {
            content: "lo".to_string(),
        },
        StreamToken::Done {
            usage: TokenUsage::exact(10, 5),
        },
    ]);
    let router = router_with_mock(mock).with_usage_tracker(tracker.clone());

    let tokens: Vec<StreamToken> = router
        .stream("openai", simple_request())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(tokens.len(), 3);
    assert!(matches!(tokens[0], StreamToken::Token { .. }));
    assert!(matches!(tokens[2], StreamToken::Done { .. }));

    assert!(
        wait_for_last_usage(&tracker, "ws1", "openai", "gpt-4o").await
    );
    let event = tracker.last_usage("ws1", "openai", "gpt-4o").await.unwrap();
    assert_eq!(event.input_tokens, 10);
    assert!(event.cost > 0.0);
}

#[tokio::test]
async fn test_stream_error_increments_failure_counter() {
    let store: Arc<dyn MeterStore> = Arc::new(MemoryMeterStore::new());
    let tracker = Arc::new(UsageTracker::new(Some(store)));

    let mock = MockProvider::new();
    mock.add_stream(vec![
        StreamToken::Token {
            content: "par".to_string(),
        },
        StreamToken::Error {
            message: "vendor exploded".to_string(),
        },
    ]);
    let router = router_with_mock(mock).with_usage_tracker(tracker.clone());

    let tokens: Vec<StreamToken> = router
        .stream("openai", simple_request())
        .await
        .unwrap()
        .collect()
        .await;

    // Already-delivered tokens survive; the error is terminal and last
    assert_eq!(tokens.len(), 2);
    assert!(matches!(tokens[1], StreamToken::Error { .. }));
    assert_eq!(tracker.provider_failures("openai").await, 1);
}

#[tokio::test]
async fn test_stream_with_credential_is_never_billed() {
    let store: Arc<dyn MeterStore> = Arc::new(MemoryMeterStore::new());
    let tracker = Arc::new(UsageTracker::new(Some(store)));

    let mock = Arc::new(MockProvider::new());
    mock.add_stream(vec![
        StreamToken::Token {
            content: "hi".to_string(),
        },
        StreamToken::Done {
            usage: TokenUsage::exact(1000, 500),
        },
    ]);
    let factory_mock = mock.clone();
    let router = ProviderRouter::new(ProviderRegistry::new(), PricingTable::new())
        .with_usage_tracker(tracker.clone())
        .with_adapter_factory(Arc::new(move |_, _| Ok(factory_mock.clone())));

    let credential = ByoaCredential {
        provider: "openai".to_string(),
        access_token: "tenant-key".to_string(),
        subscription_tier: None,
    };
    let tokens: Vec<StreamToken> = router
        .stream_with_credential(&credential, simple_request())
        .await
        .unwrap()
        .collect()
        .await;

    assert!(matches!(tokens.last(), Some(StreamToken::Done { .. })));

    assert!(
        wait_for_last_usage(&tracker, "ws1", "openai", "gpt-4o").await
    );
    let event = tracker.last_usage("ws1", "openai", "gpt-4o").await.unwrap();
    assert_eq!(event.cost, 0.0);
    assert_eq!(event.price, 0.0);
}
