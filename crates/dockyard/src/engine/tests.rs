use std::time::Duration;

use super::*;

use crate::deployment::allocator::PORT_RANGE;
use crate::testing::{test_config, FakeRunner, FakeSourceProvider};

struct Fixture {
    manager: ServiceManager,
    runner: Arc<FakeRunner>,
    source: Arc<FakeSourceProvider>,
    config: DockyardConfig,
    db: DbClient,
}

async fn fixture() -> Fixture {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let config = test_config(tempdir.path());
    // Keep tempdir alive for the duration of the test; each test has its own.
    std::mem::forget(tempdir);

    let db = DbClient::initialize(&config.database_path())
        .await
        .expect("db init");
    let runner = FakeRunner::new();
    let source = FakeSourceProvider::new();
    let manager = ServiceManager::from_config(&config, &db, runner.clone(), source.clone())
        .await
        .expect("manager");

    Fixture {
        manager,
        runner,
        source,
        config,
        db,
    }
}

fn service(repository: &str, branch: &str) -> Service {
    Service::new(repository, branch).expect("service")
}

fn manifest(json: &str) -> Manifest {
    Manifest::from_json(json).expect("manifest")
}

impl Fixture {
    fn site_path(&self, configuration: &ServiceConfiguration) -> std::path::PathBuf {
        self.config
            .nginx_sites_dir()
            .join(format!("{}.conf", configuration.id))
    }

    async fn stored_count(&self) -> usize {
        self.manager.get_status().await.expect("status").len()
    }
}

#[tokio::test]
async fn create_twice_keeps_a_single_unchanged_configuration() {
    let fixture = fixture().await;
    let service = service("org/repo", "main");

    let first = fixture.manager.create(&service, None).await.expect("create");
    let second = fixture
        .manager
        .create(&service, Some(manifest(r#"{"domain":"changed.dev"}"#)))
        .await
        .expect("create again");

    assert_eq!(first, second);
    assert_eq!(fixture.stored_count().await, 1);
}

#[tokio::test]
async fn create_fetches_the_manifest_when_none_is_supplied() {
    let fixture = fixture().await;
    fixture.source.set_manifest(
        "org/repo",
        "main",
        manifest(r#"{"type":"static","domain":"app.dev"}"#),
    );

    let configuration = fixture
        .manager
        .create(&service("org/repo", "main"), None)
        .await
        .expect("create");

    assert_eq!(configuration.service_type, "static");
    assert_eq!(configuration.domains, vec!["app.dev"]);
    assert_eq!(
        fixture.source.fetches(),
        vec!["https://raw.test/org/repo/main/service.json"]
    );
}

#[tokio::test]
async fn sequential_creations_get_distinct_ports_in_range() {
    let fixture = fixture().await;

    let mut ports = HashSet::new();
    for index in 0..12 {
        let configuration = fixture
            .manager
            .create(&service("org/repo", &format!("branch-{index}")), None)
            .await
            .expect("create");
        let port = configuration.primary_port().expect("port").host();
        assert!(PORT_RANGE.contains(&port));
        assert!(ports.insert(port), "port {port} assigned twice");
    }
    assert_eq!(fixture.stored_count().await, 12);
}

#[tokio::test]
async fn small_port_range_is_shared_without_collisions() {
    let mut fixture = fixture().await;
    fixture.manager = fixture
        .manager
        .with_allocator(PortAllocator::new(4000..=4002));

    let web = fixture
        .manager
        .create(
            &service("org/web", "main"),
            Some(manifest(r#"{"webSocket":{"path":"ws"}}"#)),
        )
        .await
        .expect("create web");
    let api = fixture
        .manager
        .create(&service("org/api", "main"), None)
        .await
        .expect("create api");

    let mut ports = web.host_ports();
    ports.extend(api.host_ports());
    ports.sort_unstable();
    assert_eq!(ports, vec![4000, 4001, 4002]);

    let error = fixture
        .manager
        .create(&service("org/extra", "main"), None)
        .await
        .expect_err("range exhausted");
    assert!(matches!(error, EngineError::ConfigurationError(_)));
}

#[tokio::test]
async fn build_then_run_reports_online_only_after_run() {
    let fixture = fixture().await;
    let service = service("org/repo", "main");

    let built = fixture.manager.build(&service, None).await.expect("build");
    let status = fixture.manager.get_status_of(&service).await.expect("status");
    assert_eq!(status.configuration.repository, "org/repo");
    assert_eq!(status.configuration.branch, "main");
    assert!(PORT_RANGE.contains(&built.primary_port().expect("port").host()));
    assert!(!status.online);

    fixture
        .manager
        .run_in_background(&service, None)
        .await
        .expect("run");
    let status = fixture.manager.get_status_of(&service).await.expect("status");
    assert!(status.online);
    assert_eq!(status.configuration, built);
    assert!(fixture.site_path(&built).exists());
    assert!(fixture.runner.commands().contains(&"service nginx reload".to_string()));
}

#[tokio::test]
async fn build_failure_stores_nothing() {
    let fixture = fixture().await;
    fixture.runner.fail_builds(true);

    let error = fixture
        .manager
        .build(&service("org/repo", "main"), None)
        .await
        .expect_err("build fails");

    assert!(matches!(error, EngineError::BuildFailure { .. }));
    assert_eq!(fixture.stored_count().await, 0);
}

#[tokio::test]
async fn failed_rebuild_leaves_the_running_instance_alone() {
    let fixture = fixture().await;
    let service = service("org/repo", "main");
    fixture.manager.build(&service, None).await.expect("build");
    let running = fixture
        .manager
        .run_in_background(&service, None)
        .await
        .expect("run");

    fixture.runner.fail_builds(true);
    fixture
        .manager
        .build(&service, Some(manifest(r#"{"domain":"new.dev"}"#)))
        .await
        .expect_err("rebuild fails");

    assert!(fixture.runner.running().contains(&running.name()));
    assert!(fixture.runner.docker_calls("stop").is_empty());
    let status = fixture.manager.get_status_of(&service).await.expect("status");
    assert_eq!(status.configuration, running);
}

#[tokio::test]
async fn unknown_manifest_type_falls_back_to_default() {
    let fixture = fixture().await;
    let configuration = fixture
        .manager
        .build(
            &service("org/repo", "main"),
            Some(manifest(r#"{"type":"fortran"}"#)),
        )
        .await
        .expect("build");

    assert_eq!(configuration.service_type, "node");
    let builds = fixture.runner.docker_calls("build");
    assert!(builds[0]
        .last()
        .is_some_and(|recipe| recipe.ends_with("images/node")));
}

#[tokio::test]
async fn rebuild_keeps_identity_and_ports_but_follows_the_manifest() {
    let fixture = fixture().await;
    let service = service("org/repo", "main");

    let first = fixture
        .manager
        .build(&service, Some(manifest(r#"{"env":{"MODE":"dev"}}"#)))
        .await
        .expect("build");
    let second = fixture
        .manager
        .build(
            &service,
            Some(manifest(r#"{"env":{"MODE":"prod"},"domain":"app.dev","memory":"64m"}"#)),
        )
        .await
        .expect("rebuild");

    assert_eq!(second.id, first.id);
    assert_eq!(second.ports, first.ports);
    assert_eq!(second.env.get("MODE").map(String::as_str), Some("prod"));
    assert_eq!(second.domains, vec!["app.dev"]);
    assert_eq!(second.memory.as_deref(), Some("64m"));
    assert_eq!(fixture.stored_count().await, 1);
}

#[tokio::test]
async fn destroy_removes_container_image_site_and_record() {
    let fixture = fixture().await;
    let service = service("org/repo", "main");
    fixture.manager.build(&service, None).await.expect("build");
    let configuration = fixture
        .manager
        .run_in_background(&service, None)
        .await
        .expect("run");
    assert!(fixture.site_path(&configuration).exists());

    fixture.manager.destroy(&service).await.expect("destroy");

    assert_eq!(fixture.stored_count().await, 0);
    assert!(!fixture.site_path(&configuration).exists());
    assert!(!fixture.runner.running().contains(&configuration.name()));
    assert_eq!(
        fixture.runner.docker_calls("rmi"),
        vec![vec!["rmi".to_string(), configuration.image_name()]]
    );
}

#[tokio::test]
async fn destroy_and_status_of_unknown_service_are_not_found() {
    let fixture = fixture().await;
    let service = service("org/ghost", "main");

    assert!(matches!(
        fixture.manager.destroy(&service).await,
        Err(EngineError::NotFound { .. })
    ));
    assert!(matches!(
        fixture.manager.get_status_of(&service).await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn stop_is_lenient_and_takes_services_offline() {
    let fixture = fixture().await;
    fixture
        .manager
        .stop(&service("org/ghost", "main"))
        .await
        .expect("stop unknown");

    let service = service("org/repo", "main");
    fixture
        .manager
        .run_in_background(&service, None)
        .await
        .expect("run");
    fixture.manager.stop(&service).await.expect("stop");

    let status = fixture.manager.get_status_of(&service).await.expect("status");
    assert!(!status.online);
}

#[tokio::test]
async fn repeated_restarts_never_share_a_host_port() {
    let fixture = fixture().await;
    let web = service("org/web", "main");
    let api = service("org/api", "main");
    for service in [&web, &api] {
        fixture
            .manager
            .run_in_background(service, Some(manifest(r#"{"webSocket":{"path":"ws"}}"#)))
            .await
            .expect("run");
    }

    for _ in 0..2 {
        fixture.manager.restart(&web).await.expect("restart web");
        fixture.manager.restart(&api).await.expect("restart api");
    }

    let published = fixture.runner.published_ports();
    let unique = published.iter().copied().collect::<HashSet<_>>();
    assert_eq!(published.len(), 4);
    assert_eq!(unique.len(), published.len());
    assert_eq!(fixture.runner.running().len(), 2);
}

#[tokio::test]
async fn run_without_manifest_reuses_the_stored_configuration() {
    let fixture = fixture().await;
    let service = service("org/repo", "main");
    let created = fixture
        .manager
        .create(&service, Some(manifest(r#"{"domain":"app.dev"}"#)))
        .await
        .expect("create");

    let ran = fixture
        .manager
        .run_in_background(&service, None)
        .await
        .expect("run");

    assert_eq!(ran, created);
    assert!(fixture.source.fetches().is_empty());
}

#[tokio::test]
async fn run_and_exit_returns_output_without_publishing() {
    let fixture = fixture().await;
    let service = service("org/repo", "main");

    let output = fixture
        .manager
        .run_and_exit(&service, Some(Manifest::default()))
        .await
        .expect("run and exit");

    assert_eq!(output, "hello from the foreground");
    assert!(fixture.runner.running().is_empty());
    assert_eq!(fixture.stored_count().await, 0);
    assert!(!fixture.runner.commands().iter().any(|command| command.starts_with("nginx")));
}

#[tokio::test]
async fn deploy_fetches_once_then_builds_and_runs() {
    let fixture = fixture().await;
    let service = service("org/repo", "main");

    let configuration = fixture.manager.deploy(&service, None).await.expect("deploy");

    assert_eq!(fixture.source.fetches().len(), 1);
    assert_eq!(fixture.runner.docker_calls("build").len(), 1);
    assert!(fixture.runner.running().contains(&configuration.name()));
    assert!(fixture.manager.get_status_of(&service).await.expect("status").online);
}

#[tokio::test]
async fn build_all_continues_past_failures() {
    let fixture = fixture().await;
    for repository in ["org/a", "org/b"] {
        fixture
            .manager
            .create(&service(repository, "main"), None)
            .await
            .expect("create");
    }
    fixture.runner.fail_builds(true);

    let outcomes = fixture.manager.build_all().await.expect("build all");

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|outcome| !outcome.succeeded()));
    assert!(fixture.runner.running().is_empty());
}

#[tokio::test]
async fn build_all_and_restart_all_bring_every_service_online() {
    let fixture = fixture().await;
    for repository in ["org/a", "org/b"] {
        fixture
            .manager
            .create(&service(repository, "main"), None)
            .await
            .expect("create");
    }

    let built = fixture.manager.build_all().await.expect("build all");
    assert!(built.iter().all(BulkOutcome::succeeded));
    assert_eq!(fixture.runner.docker_calls("build").len(), 2);

    let restarted = fixture.manager.restart_all().await.expect("restart all");
    assert!(restarted.iter().all(BulkOutcome::succeeded));

    let status = fixture.manager.get_status().await.expect("status");
    assert!(status.iter().all(|service| service.online));
}

#[tokio::test]
async fn reconcile_proxy_rewrites_sites_from_the_registry() {
    let fixture = fixture().await;
    let kept = fixture
        .manager
        .create(&service("org/a", "main"), None)
        .await
        .expect("create");
    let sites_dir = fixture.config.nginx_sites_dir();
    std::fs::create_dir_all(&sites_dir).expect("sites dir");
    std::fs::write(sites_dir.join("stale.conf"), "server {}").expect("stale site");

    let written = fixture.manager.reconcile_proxy().await.expect("reconcile");

    assert_eq!(written, 1);
    assert!(!sites_dir.join("stale.conf").exists());
    assert!(fixture.site_path(&kept).exists());
    let reloads = fixture
        .runner
        .commands()
        .into_iter()
        .filter(|command| command == "service nginx reload")
        .count();
    assert_eq!(reloads, 1);
}

#[tokio::test]
async fn proxy_reload_failure_does_not_fail_the_run() {
    let fixture = fixture().await;
    fixture.runner.fail_program("nginx");

    let configuration = fixture
        .manager
        .run_in_background(&service("org/repo", "main"), None)
        .await
        .expect("run despite proxy failure");

    assert!(fixture.runner.running().contains(&configuration.name()));
    assert!(!fixture.site_path(&configuration).exists());
}

#[tokio::test]
async fn unsafe_manifest_domains_are_rejected_before_anything_runs() {
    let fixture = fixture().await;
    let service = service("org/repo", "main");
    fixture.source.set_manifest(
        "org/repo",
        "main",
        manifest(r#"{"domain":"evil.dev; } server { server_name victim.com; }"}"#),
    );

    let error = fixture
        .manager
        .deploy(&service, None)
        .await
        .expect_err("unsafe domain");

    assert!(matches!(error, EngineError::ConfigurationError(_)));
    assert!(fixture.runner.docker_calls("build").is_empty());
    assert_eq!(fixture.stored_count().await, 0);
}

#[tokio::test]
async fn deploy_from_webhook_builds_with_pushed_manifest_and_clone_url() {
    let fixture = fixture().await;
    fixture
        .source
        .set_manifest("org/repo", "main", manifest(r#"{"type":"static"}"#));
    let webhook = WebhookService {
        service: service("org/repo", "main"),
        configuration_url: fixture.source.manifest_url("org/repo", "main"),
        clone_url: "https://mirror.test/org/repo.git".to_string(),
    };

    let configuration = fixture
        .manager
        .deploy_from_webhook(&webhook)
        .await
        .expect("deploy");

    assert_eq!(configuration.service_type, "static");
    let builds = fixture.runner.docker_calls("build");
    assert!(builds[0].contains(&"GIT_URL=https://mirror.test/org/repo.git".to_string()));
    assert!(fixture.runner.running().contains(&configuration.name()));
    assert_eq!(fixture.source.fetches().len(), 1);
}

#[tokio::test]
async fn drain_holds_the_deploy_lock() {
    let fixture = fixture().await;
    assert!(!fixture.manager.is_building());

    let guard = fixture
        .manager
        .drain(Duration::from_millis(100))
        .await
        .expect("idle engine drains immediately");
    assert!(fixture.manager.is_building());
    assert!(fixture
        .manager
        .drain(Duration::from_millis(20))
        .await
        .is_none());

    drop(guard);
    assert!(!fixture.manager.is_building());
}

#[tokio::test]
async fn drain_waits_for_accepted_background_deploys() {
    let fixture = fixture().await;
    let manager = Arc::new(fixture.manager);
    let webhook = fixture
        .source
        .service_from_webhook(
            br#"{"ref":"refs/heads/main","repository":{"full_name":"org/repo","private":false}}"#,
        )
        .expect("webhook");
    let name = webhook.service.container_name();

    manager.deploy_in_background(webhook);
    let guard = manager
        .drain(Duration::from_secs(5))
        .await
        .expect("drained");

    assert!(fixture.runner.running().contains(&name));
    drop(guard);
}

#[tokio::test]
async fn writes_from_another_handle_are_visible() {
    let fixture = fixture().await;
    let other = ServiceManager::from_config(
        &fixture.config,
        &fixture.db,
        fixture.runner.clone(),
        fixture.source.clone(),
    )
    .await
    .expect("second manager");

    other
        .create(&service("org/repo", "main"), None)
        .await
        .expect("create");

    assert_eq!(fixture.stored_count().await, 1);
}
