//! サーバーの起動と協調的シャットダウン

use crate::support::backend::{ready_mock, sleeping_backend};
use crate::support::service::{wait_for_status, TestService};
use llmsv::supervisor::LaunchMode;
use llmsv::types::{DeploymentSpec, DeploymentStatus};
use llmsv::{server, AppState};
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::test]
async fn shutdown_request_stops_server_and_backends() {
    let mock = ready_mock().await;
    let t = TestService::new(sleeping_backend());
    t.service
        .register(
            DeploymentSpec::new("org/m").with_port(mock.address().port()),
            LaunchMode::Background,
        )
        .await
        .unwrap();
    wait_for_status(&t.service, "org/m", DeploymentStatus::Ready).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(t.service.clone());
    let shutdown = state.shutdown.clone();
    let handle = tokio::spawn(server::serve(listener, state, false));

    let health: serde_json::Value = reqwest::get(format!("http://{addr}/"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["models_loaded"], 1);

    shutdown.request_shutdown();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();

    assert!(!t.service.supervisor().is_managed("org/m").await);
    assert_eq!(
        t.service.lookup("org/m").await.unwrap().status,
        DeploymentStatus::Stopped
    );
}
