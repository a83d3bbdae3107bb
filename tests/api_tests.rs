use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use doracle::api::{create_router, AppState};
use doracle::raft::{Consensus, ConsensusError, NodeStatus, Peer, Raft};
use doracle::storage::{IncrementCommand, JoinCommand};
use doracle::utils::helpers::RaftConfig;

/// Counts like a leader, or fails every call with `fail`.
struct FakeConsensus {
    high_water_mark: Mutex<i64>,
    proposals: Mutex<Vec<i32>>,
    joined: Mutex<Vec<JoinCommand>>,
    fail: Option<ConsensusError>,
}

impl FakeConsensus {
    fn new() -> Self {
        Self {
            high_water_mark: Mutex::new(-1),
            proposals: Mutex::new(Vec::new()),
            joined: Mutex::new(Vec::new()),
            fail: None,
        }
    }

    fn failing(err: ConsensusError) -> Self {
        Self {
            fail: Some(err),
            ..Self::new()
        }
    }
}

impl Consensus for FakeConsensus {
    async fn propose(&self, command: IncrementCommand) -> Result<i64, ConsensusError> {
        if let Some(err) = &self.fail {
            return Err(err.clone());
        }
        self.proposals.lock().unwrap().push(command.num);
        let mut hwm = self.high_water_mark.lock().unwrap();
        *hwm += i64::from(command.num);
        Ok(*hwm)
    }

    async fn add_member(&self, command: JoinCommand) -> Result<Peer, ConsensusError> {
        if let Some(err) = &self.fail {
            return Err(err.clone());
        }
        self.joined.lock().unwrap().push(command);
        Ok(Peer {
            name: "leader1".into(),
            connection_string: "127.0.0.1:7000".into(),
        })
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            name: "leader1".into(),
            role: "leader".into(),
            leader: Some("leader1".into()),
            high_water_mark: *self.high_water_mark.lock().unwrap(),
            commit_index: self.proposals.lock().unwrap().len() as u64,
            members: vec!["leader1".into()],
        }
    }
}

fn app(consensus: FakeConsensus) -> (Router, Arc<AppState<FakeConsensus>>) {
    let state = Arc::new(AppState::new(consensus));
    (create_router(Arc::clone(&state)), state)
}

fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(body.into())
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

#[tokio::test]
async fn doracle_returns_high_water_mark_in_decimal() {
    let (router, state) = app(FakeConsensus::new());

    let response = router.clone().oneshot(post("/doracle", "5")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "4");

    let response = router.oneshot(post("/doracle", "3\n")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "7");

    assert_eq!(*state.consensus.proposals.lock().unwrap(), vec![5, 3]);
}

#[tokio::test]
async fn doracle_rejects_malformed_batch_size() {
    for body in ["", "abc", "1.5", "99999999999"] {
        let (router, state) = app(FakeConsensus::new());
        let response = router.oneshot(post("/doracle", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {:?}", body);
        assert!(state.consensus.proposals.lock().unwrap().is_empty());
    }
}

#[tokio::test]
async fn doracle_rejects_non_positive_batch_size() {
    for body in ["0", "-4"] {
        let (router, state) = app(FakeConsensus::new());
        let response = router.oneshot(post("/doracle", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {:?}", body);
        assert!(state.consensus.proposals.lock().unwrap().is_empty());
    }
}

#[tokio::test]
async fn consensus_failures_map_to_status_codes() {
    let cases = [
        (
            ConsensusError::NotLeader { leader: None },
            StatusCode::SERVICE_UNAVAILABLE,
        ),
        (
            ConsensusError::Unavailable("apply pipeline stopped".into()),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
        (ConsensusError::Timeout, StatusCode::GATEWAY_TIMEOUT),
        (ConsensusError::Exhausted, StatusCode::INTERNAL_SERVER_ERROR),
        (
            ConsensusError::Storage("disk full".into()),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    ];

    for (err, expected) in cases {
        let (router, _) = app(FakeConsensus::failing(err.clone()));
        let response = router.oneshot(post("/doracle", "1")).await.unwrap();
        assert_eq!(response.status(), expected, "{:?}", err);
        // a failed proposal never produces a number in the body
        assert!(body_string(response).await.parse::<i64>().is_err());
    }
}

#[tokio::test]
async fn join_registers_member_and_returns_leader() {
    let (router, state) = app(FakeConsensus::new());

    let response = router
        .oneshot(post(
            "/join",
            r#"{"name":"b2c4e6f","connectionString":"127.0.0.1:7001"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let leader: Peer = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(leader.name, "leader1");
    assert_eq!(leader.connection_string, "127.0.0.1:7000");

    let joined = state.consensus.joined.lock().unwrap();
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0].name, "b2c4e6f");
    assert_eq!(joined[0].connection_string, "127.0.0.1:7001");
}

#[tokio::test]
async fn join_rejects_malformed_descriptor() {
    for body in ["", "not json", r#"{"name":"x"}"#] {
        let (router, state) = app(FakeConsensus::new());
        let response = router.oneshot(post("/join", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {:?}", body);
        assert!(state.consensus.joined.lock().unwrap().is_empty());
    }
}

#[tokio::test]
async fn join_on_follower_is_unavailable() {
    let (router, _) = app(FakeConsensus::failing(ConsensusError::NotLeader {
        leader: Some("leader1".into()),
    }));
    let response = router
        .oneshot(post(
            "/join",
            r#"{"name":"b2c4e6f","connectionString":"127.0.0.1:7001"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn health_reports_node_status() {
    let (router, _) = app(FakeConsensus::new());
    router.clone().oneshot(post("/doracle", "10")).await.unwrap();

    let response = router
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let status: NodeStatus = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(status.role, "leader");
    assert_eq!(status.high_water_mark, 9);
    assert_eq!(status.commit_index, 1);
}

#[tokio::test]
async fn router_over_real_leader_allocates_consecutive_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let config = RaftConfig::new("127.0.0.1:0".parse().unwrap(), dir.path());
    let raft = Raft::init("a1b2c3d", config).unwrap();
    raft.bootstrap().await.unwrap();

    let router = create_router(Arc::new(AppState::new(raft.clone())));

    let mut previous = -1;
    for num in [1, 4, 2] {
        let response = router
            .clone()
            .oneshot(post("/doracle", num.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let hwm: i64 = body_string(response).await.parse().unwrap();
        assert_eq!(hwm, previous + i64::from(num));
        previous = hwm;
    }
    assert_eq!(raft.high_water_mark(), 6);
}
