//! End-to-end tests of the `/act` contract over HTTP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use approx::assert_relative_eq;
use serde_json::{json, Value};
use tower::ServiceExt;

use vla_serve::backend::RawActions;
use vla_serve::server::{router, HealthResponse};
use vla_serve::stats::{DatasetStatistics, NormBounds};
use vla_serve::wire::{ActRequest, ArrayPayload, NumpyArray};
use vla_serve::{
    ActionPolicy, ActionService, BackendError, InferenceBackend, ModelInput, Observation,
    RemotePolicy, ServiceConfig, ServiceError, StatisticsTable, StubBackend,
};

fn service_config(images: u8) -> ServiceConfig {
    ServiceConfig {
        num_images_in_input: images,
        ..Default::default()
    }
}

fn service(images: u8, backend: Arc<dyn InferenceBackend>) -> Arc<ActionService> {
    Arc::new(
        ActionService::new(service_config(images), &StatisticsTable::builtin(), backend)
            .expect("valid service"),
    )
}

fn stub() -> Arc<dyn InferenceBackend> {
    Arc::new(StubBackend::zeros(8, 7))
}

fn image(value: u8) -> ArrayPayload {
    ArrayPayload::Numpy(NumpyArray::from_u8(vec![8, 8, 3], &[value; 8 * 8 * 3]))
}

fn request(wrist: bool) -> ActRequest {
    ActRequest {
        full_image: Some(image(120)),
        wrist_image: wrist.then(|| image(30)),
        state: None,
        task_description: Some("pick up the black bowl and place it on the plate".to_string()),
    }
}

async fn post_act(app: axum::Router, body: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/act")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// Fails the first call only.
struct FailOnce(AtomicUsize);

impl InferenceBackend for FailOnce {
    fn name(&self) -> &str {
        "fail-once"
    }

    fn infer(&self, _input: &ModelInput) -> Result<RawActions, BackendError> {
        if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(BackendError::new("device lost").with_detail("RuntimeError: device lost"));
        }
        Ok(vec![vec![0.0; 7]; 8])
    }
}

#[tokio::test]
async fn act_returns_chunk_of_configured_length() {
    let app = router(service(2, stub()));
    let (status, body) = post_act(app, serde_json::to_value(request(true)).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    let rows = body.as_array().expect("list of actions");
    assert_eq!(rows.len(), 8);
    assert!(rows.iter().all(|r| r.as_array().map(Vec::len) == Some(7)));
}

#[tokio::test]
async fn missing_wrist_image_is_bad_request_only_with_two_images() {
    let (status, body) = post_act(
        router(service(2, stub())),
        serde_json::to_value(request(false)).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
    assert!(body["message"].as_str().unwrap().contains("wrist_image"));

    let (status, _) = post_act(
        router(service(1, stub())),
        serde_json::to_value(request(false)).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn missing_primary_image_and_bad_arrays_are_rejected() {
    let app = router(service(1, stub()));
    let (status, body) = post_act(app.clone(), json!({"task_description": "open the drawer"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("primary_image"));

    let (status, _) = post_act(
        app.clone(),
        json!({
            "full_image": {"__numpy__": "AAAA", "dtype": "<c8", "shape": [1, 1, 3]},
            "task_description": "open the drawer"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_act(
        app,
        json!({
            "full_image": [[[0.0, 0.5, 1.0, 1.0]]],
            "task_description": "open the drawer"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn nested_float_images_are_accepted() {
    let app = router(service(1, stub()));
    let (status, body) = post_act(
        app,
        json!({
            "full_image": [[[0.0, 0.5, 1.0], [0.2, 0.2, 0.2]]],
            "task_description": "turn on the stove"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 8);
}

#[tokio::test]
async fn inference_failure_is_500_and_service_recovers() {
    let app = router(service(1, Arc::new(FailOnce(AtomicUsize::new(0)))));
    let body = serde_json::to_value(request(false)).unwrap();

    let (status, err) = post_act(app.clone(), body.clone()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(err["error"], "inference_failure");
    assert_eq!(err["detail"], "RuntimeError: device lost");

    let (status, ok) = post_act(app, body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ok.as_array().unwrap().len(), 8);
}

#[tokio::test]
async fn health_reports_configuration() {
    let response = router(service(2, stub()))
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: HealthResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(health.unnorm_key, "libero_spatial_no_noops");
    assert_eq!(health.backend, "stub");
    assert_eq!(health.chunk_horizon, 8);
    assert_eq!(health.num_images_in_input, 2);
}

#[tokio::test]
async fn remote_policy_speaks_the_same_contract() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(service(2, stub()))).await.unwrap();
    });

    let remote = RemotePolicy::new(format!("http://{addr}")).unwrap();
    let policy: Arc<dyn ActionPolicy> = Arc::new(remote.clone());

    let observation = Observation {
        primary_image: ndarray::Array3::from_elem((8, 8, 3), 10u8),
        wrist_image: Some(ndarray::Array3::from_elem((8, 8, 3), 20u8)),
        proprio_state: None,
        task_description: "put the cream cheese in the bowl".to_string(),
    };
    let chunk = policy.act(observation.clone()).await.unwrap();
    assert_eq!(chunk.len(), 8);

    // Local and remote inference agree.
    let local: Arc<dyn ActionPolicy> = service(2, stub());
    assert_eq!(local.act(observation.clone()).await.unwrap(), chunk);

    let mut no_wrist = observation;
    no_wrist.wrist_image = None;
    assert!(matches!(
        policy.act(no_wrist).await,
        Err(ServiceError::BadRequest(_))
    ));

    let health = remote.health().await.unwrap();
    assert_eq!(health.status, "ok");
}

#[tokio::test]
async fn oversized_declared_shape_is_bad_request() {
    let app = router(service(1, stub()));
    let huge = json!({
        "full_image": {"__numpy__": "", "dtype": "|u1", "shape": [1u64 << 32, 1u64 << 32, 3]},
        "task_description": "open the drawer"
    });

    // Runs in its own task so a panic surfaces as a JoinError, not a hang.
    let (status, body) = tokio::spawn(post_act(app.clone(), huge)).await.unwrap();
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");

    let (status, _) = post_act(
        app,
        json!({
            "full_image": {"__numpy__": "AAAA", "dtype": "|u1", "shape": [4096, 4096, 3]},
            "task_description": "open the drawer"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

/// Echoes the normalized proprio state into every action row.
struct EchoState;

impl InferenceBackend for EchoState {
    fn name(&self) -> &str {
        "echo-state"
    }

    fn infer(&self, input: &ModelInput) -> Result<RawActions, BackendError> {
        let state = input
            .proprio
            .as_ref()
            .ok_or_else(|| BackendError::new("no proprio"))?;
        Ok(vec![state[..7].to_vec(); 8])
    }
}

fn proprio_service() -> Arc<ActionService> {
    let stats = StatisticsTable::new().with_dataset(
        "unit",
        DatasetStatistics {
            action: NormBounds {
                q01: vec![-1.0; 7],
                q99: vec![1.0; 7],
                mask: None,
            },
            proprio: Some(NormBounds {
                q01: vec![0.0; 8],
                q99: vec![2.0; 8],
                mask: None,
            }),
        },
    );
    let config = ServiceConfig {
        num_images_in_input: 1,
        use_proprio: true,
        unnorm_key: "unit".to_string(),
        ..Default::default()
    };
    Arc::new(ActionService::new(config, &stats, Arc::new(EchoState)).expect("valid service"))
}

#[tokio::test]
async fn state_is_decoded_and_normalized_over_http() {
    let app = router(proprio_service());

    let mut req = request(false);
    req.state = Some(ArrayPayload::Numpy(NumpyArray::from_f32(
        vec![8],
        &[2.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
    )));
    let (status, body) = post_act(app.clone(), serde_json::to_value(&req).unwrap()).await;
    assert_eq!(status, StatusCode::OK);

    let first: Vec<f64> = body[0]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_f64().unwrap())
        .collect();
    assert_eq!(first.len(), 7);
    assert_relative_eq!(first[0], 1.0, epsilon = 1e-5);
    assert_relative_eq!(first[1], -1.0, epsilon = 1e-5);
    assert_relative_eq!(first[2], 0.0, epsilon = 1e-5);

    // Nested lists work for state too.
    let mut nested = serde_json::to_value(request(false)).unwrap();
    nested["state"] = json!([0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    let (status, _) = post_act(app.clone(), nested).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post_act(app.clone(), serde_json::to_value(request(false)).unwrap()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("state"));

    let mut short = request(false);
    short.state = Some(ArrayPayload::Numpy(NumpyArray::from_f32(vec![3], &[0.0; 3])));
    let (status, _) = post_act(app, serde_json::to_value(&short).unwrap()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
