//! 記述子の保存と再起動時の再登録

use crate::support::backend::{ready_mock, sleeping_backend};
use crate::support::service::{wait_for_status, TestService};
use llmsv::service::ModelService;
use llmsv::store::DeploymentDescriptor;
use llmsv::supervisor::LaunchMode;
use llmsv::types::{DeploymentSpec, DeploymentStatus, LaunchParams};

#[tokio::test]
async fn saved_deployments_are_restored_on_the_same_port() {
    let mock = ready_mock().await;
    let port = mock.address().port();
    let t = TestService::new(sleeping_backend());

    let spec = DeploymentSpec::new("Qwen/Qwen2-7B")
        .with_port(port)
        .with_device("1")
        .with_launch(LaunchParams {
            max_model_len: 4096,
            ..LaunchParams::default()
        });
    let record = t.service.register(spec, LaunchMode::Background).await.unwrap();

    let path = t.service.store().path_for("Qwen2-7B");
    let saved: DeploymentDescriptor =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(saved.model_id, "Qwen/Qwen2-7B");
    assert_eq!(saved.port, port);
    assert_eq!(saved.gpu_id, "1");
    assert_eq!(saved.pid, record.pid);

    wait_for_status(&t.service, "Qwen2-7B", DeploymentStatus::Ready).await;
    t.service.shutdown().await;
    assert!(path.exists(), "shutdown must keep descriptors");

    std::fs::write(t.service.store().dir().join("broken.json"), "{").unwrap();

    let restarted = ModelService::new(&t.config).unwrap();
    let report = restarted.restore().await.unwrap();
    assert_eq!(report.restored, vec!["Qwen/Qwen2-7B".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].0.ends_with("broken.json"));

    let restored = wait_for_status(&restarted, "Qwen2-7B", DeploymentStatus::Ready).await;
    assert_eq!(restored.port, port);
    assert_eq!(restored.device, "1");
    assert_eq!(restored.launch.max_model_len, 4096);
    restarted.shutdown().await;
}

#[tokio::test]
async fn unregister_deletes_the_descriptor() {
    let mock = ready_mock().await;
    let t = TestService::new(sleeping_backend());
    t.service
        .register(
            DeploymentSpec::new("org/m").with_port(mock.address().port()),
            LaunchMode::Background,
        )
        .await
        .unwrap();
    let path = t.service.store().path_for("m");
    assert!(path.exists());

    t.service.unregister("org/m").await.unwrap();
    assert!(!path.exists());

    let restarted = ModelService::new(&t.config).unwrap();
    assert!(restarted.restore().await.unwrap().restored.is_empty());
}
