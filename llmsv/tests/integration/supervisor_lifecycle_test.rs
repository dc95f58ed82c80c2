//! バックエンドプロセスのライフサイクル（起動監視・失敗・停止）

use crate::support::backend::{
    crashing_backend, eventually_ready_mock, ready_mock, sleeping_backend, unhealthy_mock,
};
use crate::support::service::{wait_for_status, TestService};
use llmsv::common::SvError;
use llmsv::events::DeploymentEvent;
use llmsv::supervisor::LaunchMode;
use llmsv::types::{DeploymentSpec, DeploymentStatus};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;

fn process_exists(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None::<Signal>) != Err(Errno::ESRCH)
}

#[tokio::test]
async fn registered_backend_goes_from_loading_to_ready() {
    let mock = ready_mock().await;
    let port = mock.address().port();
    let t = TestService::new(sleeping_backend());
    let mut events = t.service.events().subscribe();

    let record = t
        .service
        .register(DeploymentSpec::new("Qwen/Qwen2-7B").with_port(port), LaunchMode::Background)
        .await
        .unwrap();
    assert_eq!(record.port, port);
    assert_eq!(record.display_name, "Qwen2-7B");
    assert!(record.pid.is_some());

    match events.recv().await.unwrap() {
        DeploymentEvent::Registered { status, port: p, .. } => {
            assert_eq!(status, DeploymentStatus::Loading);
            assert_eq!(p, port);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let ready = wait_for_status(&t.service, "Qwen2-7B", DeploymentStatus::Ready).await;
    assert!(ready.uptime() > Duration::ZERO);
    assert_ne!(ready.uptime_display(), "Not started");
    assert_eq!(
        events.recv().await.unwrap(),
        DeploymentEvent::StatusChanged {
            identity: "Qwen/Qwen2-7B".to_string(),
            old_status: DeploymentStatus::Loading,
            new_status: DeploymentStatus::Ready,
        }
    );

    let pid = ready.pid.unwrap();
    assert!(process_exists(pid));
    let removed = t.service.unregister("Qwen/Qwen2-7B").await.unwrap();
    assert_eq!(removed.status, DeploymentStatus::Stopped);
    assert!(!process_exists(pid));
    assert!(!t.service.supervisor().is_managed("Qwen/Qwen2-7B").await);
}

#[tokio::test]
async fn crashing_backend_fails_with_exit_code_and_log_tail() {
    let mock = unhealthy_mock().await;
    let t = TestService::new(crashing_backend("CUDA out of memory", 1));

    let err = t
        .service
        .register(
            DeploymentSpec::new("org/broken").with_port(mock.address().port()),
            LaunchMode::Wait,
        )
        .await
        .unwrap_err();
    let SvError::ProcessFailure(diagnostics) = err else {
        panic!("expected process failure, got {err:?}");
    };
    assert_eq!(diagnostics.exit_code, Some(1));
    assert!(diagnostics.log_tail.contains("CUDA out of memory"));

    let record = t.service.lookup("broken").await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(record.diagnostics, Some(diagnostics));
}

#[tokio::test]
async fn background_crash_is_recorded_on_the_record() {
    let mock = unhealthy_mock().await;
    let t = TestService::new(crashing_backend("bad weights", 3));

    t.service
        .register(
            DeploymentSpec::new("org/broken").with_port(mock.address().port()),
            LaunchMode::Background,
        )
        .await
        .unwrap();
    let failed = wait_for_status(&t.service, "org/broken", DeploymentStatus::Failed).await;
    let diagnostics = failed.diagnostics.unwrap();
    assert_eq!(diagnostics.exit_code, Some(3));
    assert!(diagnostics.log_tail.contains("bad weights"));
}

#[tokio::test]
async fn slow_backend_moves_to_starting_then_ready() {
    let mock = eventually_ready_mock(8).await;
    let t = TestService::with(sleeping_backend(), |config| {
        config.supervisor.readiness.initial_attempts = 3;
    });
    let mut events = t.service.events().subscribe();

    t.service
        .register(
            DeploymentSpec::new("org/slow").with_port(mock.address().port()),
            LaunchMode::Wait,
        )
        .await
        .unwrap();
    let handle = t.service.supervisor().watch("org/slow").await.unwrap();
    assert_ne!(handle.status(), DeploymentStatus::Loading);

    let mut transitions: Vec<(DeploymentStatus, DeploymentStatus)> = Vec::new();
    while transitions.last().map(|(_, next)| *next) != Some(DeploymentStatus::Ready) {
        let event = tokio::time::timeout(Duration::from_secs(15), events.recv())
            .await
            .expect("timed out waiting for readiness")
            .unwrap();
        if let DeploymentEvent::StatusChanged {
            old_status,
            new_status,
            ..
        } = event
        {
            transitions.push((old_status, new_status));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (DeploymentStatus::Loading, DeploymentStatus::Starting),
            (DeploymentStatus::Starting, DeploymentStatus::Ready),
        ]
    );
}

#[tokio::test]
async fn startup_deadline_fails_and_kills_the_backend() {
    let mock = unhealthy_mock().await;
    let t = TestService::with(sleeping_backend(), |config| {
        config.supervisor.readiness.initial_attempts = 2;
        config.supervisor.readiness.startup_deadline = Some(Duration::from_millis(300));
    });

    let record = t
        .service
        .register(
            DeploymentSpec::new("org/stuck").with_port(mock.address().port()),
            LaunchMode::Background,
        )
        .await
        .unwrap();
    let pid = record.pid.unwrap();

    let failed = wait_for_status(&t.service, "org/stuck", DeploymentStatus::Failed).await;
    assert_eq!(
        failed.diagnostics.unwrap().reason,
        "readiness deadline exceeded"
    );
    assert!(!process_exists(pid));
}

#[tokio::test]
async fn removing_a_starting_deployment_terminates_its_process() {
    let mock = unhealthy_mock().await;
    let t = TestService::with(sleeping_backend(), |config| {
        config.supervisor.readiness.initial_attempts = 2;
        config.supervisor.readiness.startup_deadline = None;
    });

    t.service
        .register(
            DeploymentSpec::new("org/pending").with_port(mock.address().port()),
            LaunchMode::Background,
        )
        .await
        .unwrap();
    let starting = wait_for_status(&t.service, "pending", DeploymentStatus::Starting).await;
    let pid = starting.pid.unwrap();

    let removed = t.service.unregister("pending").await.unwrap();
    assert_eq!(removed.identity, "org/pending");
    assert!(!process_exists(pid));
    assert!(t.service.list().await.is_empty());
}

#[tokio::test]
async fn removing_an_unknown_identity_changes_nothing() {
    let mock = ready_mock().await;
    let t = TestService::new(sleeping_backend());
    t.service
        .register(
            DeploymentSpec::new("org/m").with_port(mock.address().port()),
            LaunchMode::Background,
        )
        .await
        .unwrap();
    let before = wait_for_status(&t.service, "org/m", DeploymentStatus::Ready).await;
    let mut events = t.service.events().subscribe();

    assert!(matches!(
        t.service.unregister("ghost").await,
        Err(SvError::NotFound(_))
    ));
    assert!(matches!(
        t.service.supervisor().terminate("ghost").await,
        Err(SvError::NotFound(_))
    ));

    assert!(events.try_recv().is_err());
    assert_eq!(t.service.list().await, vec![before.clone()]);
    assert!(process_exists(before.pid.unwrap()));
    t.service.shutdown().await;
}

#[tokio::test]
async fn duplicate_registration_leaves_the_first_record_unchanged() {
    let mock = ready_mock().await;
    let t = TestService::new(sleeping_backend());
    let first = t
        .service
        .register(
            DeploymentSpec::new("org/m").with_port(mock.address().port()),
            LaunchMode::Background,
        )
        .await
        .unwrap();

    let other_port = mock.address().port().wrapping_add(1).max(1);
    let err = t
        .service
        .register(
            DeploymentSpec::new("org/m").with_port(other_port),
            LaunchMode::Background,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SvError::DuplicateIdentity(ref id) if id == "org/m"));

    let current = t.service.lookup("org/m").await.unwrap();
    assert_eq!(current.port, first.port);
    assert_eq!(current.pid, first.pid);
    assert_eq!(t.service.list().await.len(), 1);
    assert!(!t.service.allocator().is_issued(other_port));
    t.service.shutdown().await;
}

#[tokio::test]
async fn automatic_ports_are_distinct() {
    let t = TestService::with(sleeping_backend(), |config| {
        config.starting_port = 41000;
        config.supervisor.readiness.startup_deadline = None;
    });

    let a = t
        .service
        .register(DeploymentSpec::new("org/a"), LaunchMode::Background)
        .await
        .unwrap();
    let b = t
        .service
        .register(DeploymentSpec::new("org/b"), LaunchMode::Background)
        .await
        .unwrap();
    assert_eq!(a.port, 41000);
    assert_eq!(b.port, 41001);
    assert_eq!(a.endpoint_url, "http://127.0.0.1:41000");
    t.service.shutdown().await;
}

#[tokio::test]
async fn concurrent_registrations_of_one_identity_do_not_both_succeed() {
    let mock = ready_mock().await;
    let t = TestService::new(sleeping_backend());
    let spec = || DeploymentSpec::new("org/m").with_port(mock.address().port());

    let results = futures::future::join_all(
        (0..2).map(|_| t.service.register(spec(), LaunchMode::Background)),
    )
    .await;

    let succeeded = results.iter().filter(|result| result.is_ok()).count();
    let duplicates = results
        .iter()
        .filter(|result| matches!(result, Err(SvError::DuplicateIdentity(id)) if id == "org/m"))
        .count();
    assert_eq!(succeeded, 1, "results: {results:?}");
    assert_eq!(duplicates, 1, "results: {results:?}");
    assert_eq!(t.service.list().await.len(), 1);

    let record = wait_for_status(&t.service, "org/m", DeploymentStatus::Ready).await;
    assert!(record.pid.is_some());
    t.service.shutdown().await;
}
