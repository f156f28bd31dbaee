mod common;

use self::common::*;
use hpa_guard_runtime::core::Environment;
use hyper::{http, Request, StatusCode};
use std::time::Duration;

#[tokio::test]
async fn rejects_hpa_targeting_single_replica_deployment() {
    let cluster = FakeCluster::default().with_deployment("shop", "web", 1);
    let webhook = Webhook::new(cluster, Environment::Development).await;

    let rsp = webhook.denies(hpa("CREATE", "shop", "web-hpa", "web")).await;
    assert_eq!(rsp["uid"], UID);
    assert_eq!(rsp["status"]["code"], 400);
    let message = rsp["status"]["message"].as_str().unwrap();
    assert!(message.contains("1 replica"), "{message}");
    assert!(message.contains("Suggestions:"), "{message}");

    // Updates are held to the same rule.
    webhook.denies(hpa("UPDATE", "shop", "web-hpa", "web")).await;
}

#[tokio::test]
async fn accepts_hpa_targeting_scaled_deployment() {
    let cluster = FakeCluster::default().with_deployment("shop", "web", 2);
    let webhook = Webhook::new(cluster, Environment::Development).await;

    let rsp = webhook.allows(hpa("CREATE", "shop", "web-hpa", "web")).await;
    assert_eq!(rsp["uid"], UID);
}

#[tokio::test]
async fn rejects_scaling_deployment_down_to_one_replica_under_hpa() {
    let cluster = FakeCluster::default()
        .with_deployment("shop", "web", 2)
        .with_hpa("shop", "web-hpa", "web");
    let webhook = Webhook::new(cluster, Environment::Development).await;

    let rsp = webhook.denies(deployment("UPDATE", "shop", "web", 1)).await;
    let message = rsp["status"]["message"].as_str().unwrap();
    assert!(message.contains("1 replica"), "{message}");
    assert!(message.contains("web-hpa"), "{message}");

    webhook.allows(deployment("UPDATE", "shop", "web", 3)).await;
}

#[tokio::test]
async fn accepts_hpa_targeting_missing_deployment() {
    let webhook = Webhook::new(FakeCluster::default(), Environment::Development).await;
    webhook.allows(hpa("CREATE", "shop", "ghost-hpa", "ghost")).await;
}

#[tokio::test]
async fn hpa_in_another_namespace_does_not_conflict() {
    let cluster = FakeCluster::default().with_hpa("other", "web-hpa", "web");
    let webhook = Webhook::new(cluster, Environment::Development).await;
    webhook.allows(deployment("CREATE", "shop", "web", 1)).await;
}

#[tokio::test]
async fn accepts_hpa_targeting_other_kinds() {
    let cluster = FakeCluster::default().with_deployment("shop", "web", 1);
    let webhook = Webhook::new(cluster, Environment::Development).await;
    webhook
        .allows(hpa_targeting("CREATE", "shop", "web-hpa", "StatefulSet", "web"))
        .await;
}

#[tokio::test]
async fn decodes_autoscaling_v1() {
    let cluster = FakeCluster::default().with_deployment("shop", "web", 1);
    let webhook = Webhook::new(cluster, Environment::Development).await;
    webhook.denies(hpa_v1("CREATE", "shop", "web-hpa", "web")).await;
}

#[tokio::test]
async fn verdicts_are_idempotent() {
    let cluster = FakeCluster::default().with_deployment("shop", "web", 1);
    let webhook = Webhook::new(cluster, Environment::Development).await;

    let first = webhook.denies(hpa("CREATE", "shop", "web-hpa", "web")).await;
    let second = webhook.denies(hpa("CREATE", "shop", "web-hpa", "web")).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn deletes_are_not_validated() {
    let cluster = FakeCluster::default()
        .with_deployment("shop", "web", 1)
        .with_hpa("shop", "web-hpa", "web");
    cluster.set_unreachable(true);
    let webhook = Webhook::new(cluster, Environment::Development).await;
    webhook.allows(hpa("DELETE", "shop", "web-hpa", "web")).await;
}

#[tokio::test]
async fn accepts_unsupported_kinds() {
    let webhook = Webhook::new(FakeCluster::default(), Environment::Development).await;
    let configmap = review(
        "",
        "v1",
        "ConfigMap",
        "configmaps",
        "CREATE",
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "settings", "namespace": "shop" },
            "data": { "replicas": "1" },
        }),
    );
    webhook.allows(configmap).await;
}

#[tokio::test]
async fn api_failures_are_denied_as_retryable() {
    let cluster = FakeCluster::default();
    cluster.set_unreachable(true);
    let webhook = Webhook::new(cluster, Environment::Production).await;

    let rsp = webhook.denies(hpa("CREATE", "shop", "web-hpa", "web")).await;
    assert_eq!(rsp["status"]["code"], 503);
    assert_eq!(rsp["status"]["reason"], "Retryable");
}

#[tokio::test]
async fn validation_times_out() {
    let cluster = FakeCluster::default().with_deployment("shop", "web", 1);
    cluster.set_delay(Duration::from_secs(30));
    let webhook =
        Webhook::with_timeout(cluster, Environment::Development, Duration::from_millis(50)).await;

    let rsp = webhook.denies(hpa("CREATE", "shop", "web-hpa", "web")).await;
    assert_eq!(rsp["status"]["code"], 503);
    let message = rsp["status"]["message"].as_str().unwrap();
    assert!(message.contains("did not complete"), "{message}");
}

#[tokio::test]
async fn panics_become_internal_errors() {
    let cluster = FakeCluster::default();
    cluster.set_panic();
    let webhook = Webhook::new(cluster, Environment::Production).await;

    let rsp = webhook.denies(hpa("CREATE", "shop", "web-hpa", "web")).await;
    assert_eq!(rsp["uid"], UID);
    assert_eq!(rsp["status"]["code"], 500);
    let message = rsp["status"]["message"].as_str().unwrap();
    assert!(!message.contains("injected panic"), "{message}");
    assert!(message.contains("request ID"), "{message}");
}

#[tokio::test]
async fn malformed_objects_are_internal_errors() {
    let webhook = Webhook::new(FakeCluster::default(), Environment::Development).await;
    let mut review = deployment("CREATE", "shop", "web", 1);
    review["request"]["object"]["spec"]["replicas"] = serde_json::json!("one");

    let rsp = webhook.denies(review).await;
    assert_eq!(rsp["status"]["code"], 500);
    assert_eq!(rsp["status"]["reason"], "Internal");
}

#[tokio::test]
async fn invalid_reviews_are_rejected() {
    let webhook = Webhook::new(FakeCluster::default(), Environment::Development).await;
    let req = Request::post("/validate")
        .body("{\"not\": \"a review\"}".to_string().into())
        .unwrap();
    let reply = webhook.call(req).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["response"]["allowed"], false);
}

#[tokio::test]
async fn validate_only_accepts_post() {
    let webhook = Webhook::new(FakeCluster::default(), Environment::Development).await;
    let reply = webhook.get("/validate").await;
    assert_eq!(reply.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(reply.headers[http::header::ALLOW], "POST");

    let reply = webhook.get("/nope").await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn responses_carry_security_headers() {
    let webhook = Webhook::new(FakeCluster::default(), Environment::Development).await;
    for reply in [
        webhook.call(post_review(hpa("CREATE", "shop", "web-hpa", "web"))).await,
        webhook.get("/livez").await,
        webhook.get("/nope").await,
    ] {
        assert_eq!(reply.headers["x-content-type-options"], "nosniff");
        assert_eq!(reply.headers["x-frame-options"], "DENY");
        assert_eq!(reply.headers["x-xss-protection"], "1; mode=block");
        let request_id = reply.headers["x-request-id"].to_str().unwrap();
        assert_eq!(request_id.len(), 36, "{request_id}");
    }
}

#[tokio::test]
async fn exports_admission_metrics() {
    let cluster = FakeCluster::default().with_deployment("shop", "web", 1);
    let webhook = Webhook::new(cluster, Environment::Development).await;
    webhook.denies(hpa("CREATE", "shop", "web-hpa", "web")).await;

    let reply = webhook.get("/metrics").await;
    assert_eq!(reply.status, StatusCode::OK);
    let text = reply.body.as_str().unwrap();
    assert!(
        text.contains(
            r#"hpa_guard_admission_requests_total{kind="HorizontalPodAutoscaler",operation="CREATE",allowed="false"} 1"#
        ),
        "{text}"
    );
    assert!(
        text.contains(r#"hpa_guard_errors_total{error_kind="validation",retryable="false"} 1"#),
        "{text}"
    );
}

#[tokio::test]
async fn hpa_then_single_replica_deployment_is_rejected() {
    let webhook = Webhook::new(FakeCluster::default(), Environment::Development).await;

    // The target does not exist yet, so the HPA is admitted and persisted.
    webhook.allows(hpa("CREATE", "shop", "web-hpa", "web")).await;
    webhook.cluster.clone().with_hpa("shop", "web-hpa", "web");

    webhook.denies(deployment("CREATE", "shop", "web", 1)).await;
}

#[tokio::test]
async fn single_replica_deployment_then_hpa_is_rejected() {
    let webhook = Webhook::new(FakeCluster::default(), Environment::Development).await;

    // No HPA targets it yet, so the Deployment is admitted and persisted.
    webhook.allows(deployment("CREATE", "shop", "web", 1)).await;
    webhook.cluster.clone().with_deployment("shop", "web", 1);

    webhook.denies(hpa("CREATE", "shop", "web-hpa", "web")).await;
}

#[tokio::test]
async fn oversized_reviews_are_refused() {
    let webhook = Webhook::new(FakeCluster::default(), Environment::Development).await;
    let req = Request::post("/validate")
        .body(bytes::Bytes::from(vec![b' '; 4 * 1024 * 1024]).into())
        .unwrap();
    let reply = webhook.call(req).await;
    assert_eq!(reply.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(reply.headers.contains_key("x-request-id"));
}
