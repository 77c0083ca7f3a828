//! End-to-end scenarios for the monitor control plane: deployment
//! lifecycle against the registry and renderer, certificate hot-reload
//! against a scripted HAProxy admin socket.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::Mutex;

use turkis::config::Settings;
use turkis::error::AdminSocketError;
use turkis::haproxy::AdminClient;
use turkis::labels::DeploymentLabels;
use turkis::monitor::reject_conflicts;
use turkis::proxy_config::ConfigWriter;
use turkis::registry::{
    DeploymentInstance, DeploymentRegistry, ObserveOutcome, RemovalOutcome,
};

fn settings(root: &Path) -> Settings {
    Settings {
        root: root.to_path_buf(),
        docker_host: None,
        admin_socket: root.join("admin.sock"),
        dry_run: false,
        tls_staging: true,
        no_tls: false,
    }
}

fn app_labels(deployment_id: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert("turkis.appName".to_string(), "A".to_string());
    labels.insert("turkis.deployment-id".to_string(), deployment_id.to_string());
    labels.insert("turkis.acme.email".to_string(), "a@b.example".to_string());
    labels.insert("turkis.port".to_string(), "80".to_string());
    labels.insert("turkis.domain.0".to_string(), "foo.example.com".to_string());
    labels.insert(
        "turkis.domain.0.alias.0".to_string(),
        "www.foo.example.com".to_string(),
    );
    labels
}

fn instance(container_id: &str, ip: &str) -> DeploymentInstance {
    DeploymentInstance {
        container_id: container_id.to_string(),
        ip: ip.to_string(),
        port: "80".to_string(),
    }
}

/// A scripted HAProxy admin socket: accepts one command per connection,
/// records it and answers with whatever the responder closure returns.
struct FakeHaproxy {
    commands: Arc<Mutex<Vec<String>>>,
}

impl FakeHaproxy {
    fn spawn<F>(socket_path: PathBuf, respond: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        let commands: Arc<Mutex<Vec<String>>> = Arc::default();
        let recorded = Arc::clone(&commands);

        let listener = UnixListener::bind(&socket_path).expect("bind fake admin socket");
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                if reader.read_line(&mut line).await.is_err() {
                    continue;
                }
                let command = line.trim_end().to_string();
                let response = respond(&command);
                recorded.lock().await.push(command);

                let mut stream = reader.into_inner();
                let _ = stream.write_all(response.as_bytes()).await;
                // Dropping the stream half-closes, which ends the client read.
            }
        });

        Self { commands }
    }

    async fn commands(&self) -> Vec<String> {
        self.commands.lock().await.clone()
    }
}

// S1: first deploy of an app fills the registry and the rendered config.
#[tokio::test]
async fn first_deploy_renders_backend_and_routes() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings(tmp.path());

    let mut registry = DeploymentRegistry::new();
    let labels = DeploymentLabels::parse(&app_labels("20240101000000")).unwrap();
    let outcome = registry.observe_start(labels, instance("c1", "10.0.0.2"));
    assert_eq!(outcome, ObserveOutcome::Created);

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 1);

    let accepted = reject_conflicts(&snapshot);
    let writer = ConfigWriter::new(&settings, 8080);
    let rendered = writer.render(&accepted);

    assert!(rendered.contains("backend A\n"));
    assert!(rendered.contains("server A/inst0 10.0.0.2:80 check"));
    assert!(rendered.contains("acl A_foo_example_com_canonical hdr(host) -i foo.example.com"));
    assert!(rendered.contains("use_backend A if A_foo_example_com_canonical"));
    assert!(rendered.contains(
        "http-request redirect code 301 location https://foo.example.com%[req.uri] if A_www_foo_example_com_alias"
    ));

    // The advertised domain set is canonical plus alias.
    let deployment = &accepted[0];
    let hosts: Vec<&str> = deployment.labels.all_hosts().collect();
    assert_eq!(hosts, vec!["foo.example.com", "www.foo.example.com"]);
}

// S2: a newer generation displaces the old one; only the new instance is
// rendered, the domain set is unchanged.
#[tokio::test]
async fn blue_green_cutover_replaces_instances() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings(tmp.path());
    let writer = ConfigWriter::new(&settings, 8080);

    let mut registry = DeploymentRegistry::new();
    let blue = DeploymentLabels::parse(&app_labels("20240101000000")).unwrap();
    registry.observe_start(blue, instance("c1", "10.0.0.2"));

    let green = DeploymentLabels::parse(&app_labels("20240102000000")).unwrap();
    let outcome = registry.observe_start(green, instance("c2", "10.0.0.3"));
    assert_eq!(outcome, ObserveOutcome::Replaced);

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].labels.deployment_id, "20240102000000");

    let rendered = writer.render(&reject_conflicts(&snapshot));
    assert!(rendered.contains("server A/inst0 10.0.0.3:80 check"));
    assert!(!rendered.contains("10.0.0.2"));

    // Same domains before and after the cutover.
    let hosts: Vec<&str> = snapshot[0].labels.all_hosts().collect();
    assert_eq!(hosts, vec!["foo.example.com", "www.foo.example.com"]);
}

// S3: the displaced generation's container dies after the cutover; the
// registry has already forgotten it.
#[tokio::test]
async fn orphaned_container_death_changes_nothing() {
    let mut registry = DeploymentRegistry::new();
    let blue = DeploymentLabels::parse(&app_labels("20240101000000")).unwrap();
    registry.observe_start(blue, instance("c1", "10.0.0.2"));
    let green = DeploymentLabels::parse(&app_labels("20240102000000")).unwrap();
    registry.observe_start(green, instance("c2", "10.0.0.3"));

    assert_eq!(registry.observe_removal("c1"), RemovalOutcome::NoChange);

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].labels.deployment_id, "20240102000000");
}

// S4: a container that opted out via `turkis.ignore` is invisible.
#[tokio::test]
async fn ignored_container_never_reaches_registry() {
    use turkis::docker::Inspected;

    let mut labels = app_labels("20240101000000");
    labels.insert("turkis.ignore".to_string(), "true".to_string());

    let inspected = Inspected {
        labels,
        networks: vec!["turkis-public".to_string()],
        ip: Some("10.0.0.5".to_string()),
    };

    // The source drops the start event before the registry ever sees it.
    assert!(inspected.opted_out());
    assert!(!inspected.eligible());
}

// S5: installing a certificate sends exactly the four store commands, in
// order, each on its own connection.
#[tokio::test]
async fn certificate_install_sends_four_ordered_commands() {
    let tmp = tempfile::tempdir().unwrap();
    let socket_path = tmp.path().join("admin.sock");
    let fake = FakeHaproxy::spawn(socket_path.clone(), |_| "\n".to_string());

    let client = AdminClient::new(&socket_path, false);
    client
        .install_certificate(Path::new("/certs/foo.example.com.pem"), "foo.example.com")
        .await
        .unwrap();

    assert_eq!(
        fake.commands().await,
        vec![
            "show ssl cert".to_string(),
            "new ssl cert /certs/foo.example.com.pem".to_string(),
            "set ssl cert foo.example.com /certs/foo.example.com.pem".to_string(),
            "commit ssl cert".to_string(),
        ]
    );
}

// S5, unsupported variant: an old HAProxy answering "Unknown command" on
// the third step aborts before the commit.
#[tokio::test]
async fn certificate_install_aborts_on_unknown_command() {
    let tmp = tempfile::tempdir().unwrap();
    let socket_path = tmp.path().join("admin.sock");
    let fake = FakeHaproxy::spawn(socket_path.clone(), |command| {
        if command.starts_with("set ssl cert") {
            "Unknown command: 'set ssl cert'\n".to_string()
        } else {
            "\n".to_string()
        }
    });

    let client = AdminClient::new(&socket_path, false);
    let err = client
        .install_certificate(Path::new("/certs/foo.example.com.pem"), "foo.example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, AdminSocketError::CommandUnsupported { .. }));

    let commands = fake.commands().await;
    assert_eq!(commands.len(), 3);
    assert!(!commands.iter().any(|c| c == "commit ssl cert"));
}

// S6: a flapping admin socket loses the reload but never the on-disk
// configuration; the next reconcile succeeds.
#[tokio::test]
async fn socket_flap_preserves_config_and_recovers() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings(tmp.path());
    settings.ensure_directories().unwrap();

    let writer = ConfigWriter::new(&settings, 8080);
    let client = AdminClient::new(&settings.admin_socket, false);

    let mut registry = DeploymentRegistry::new();
    let labels = DeploymentLabels::parse(&app_labels("20240101000000")).unwrap();
    registry.observe_start(labels, instance("c1", "10.0.0.2"));
    let rendered = writer.render(&reject_conflicts(&registry.snapshot()));

    // First pass: nothing listening. Publish succeeds, reload fails.
    writer.publish(&rendered).await.unwrap();
    let err = client.reload().await.unwrap_err();
    assert!(matches!(err, AdminSocketError::Io(_)));

    let on_disk = tokio::fs::read_to_string(writer.config_path()).await.unwrap();
    assert_eq!(on_disk, rendered);

    // The socket comes back; the next pass reloads the same config.
    let fake = FakeHaproxy::spawn(settings.admin_socket.clone(), |_| "\n".to_string());
    writer.publish(&rendered).await.unwrap();
    client.reload().await.unwrap();

    assert_eq!(fake.commands().await, vec!["reload".to_string()]);
    let on_disk = tokio::fs::read_to_string(writer.config_path()).await.unwrap();
    assert_eq!(on_disk, rendered);
}

// Drive the whole monitor loop over its channels: a start event leads to a
// published configuration, a death event to its removal.
#[tokio::test]
async fn monitor_loop_publishes_on_events() {
    use tokio::sync::{mpsc, watch};
    use turkis::docker::{ContainerEvent, ContainerEventKind, Inspected};
    use turkis::monitor::Monitor;

    let tmp = tempfile::tempdir().unwrap();
    let settings = settings(tmp.path());
    settings.ensure_directories().unwrap();

    // Dry-run admin client: reloads are logged, never sent.
    let admin = AdminClient::new(&settings.admin_socket, true);
    let writer = ConfigWriter::new(&settings, 8080);
    let config_path = writer.config_path().clone();

    let (events_tx, events_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = Monitor::new(writer, admin, None, events_rx, shutdown_rx);
    let handle = tokio::spawn(monitor.run());

    events_tx
        .send(ContainerEvent {
            kind: ContainerEventKind::Start,
            id: "c1".to_string(),
            inspected: Some(Inspected {
                labels: app_labels("20240101000000"),
                networks: vec!["turkis-public".to_string()],
                ip: Some("10.0.0.2".to_string()),
            }),
        })
        .await
        .unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        if let Ok(config) = tokio::fs::read_to_string(&config_path).await {
            if config.contains("server A/inst0 10.0.0.2:80 check") {
                break;
            }
        }
        assert!(
            std::time::Instant::now() < deadline,
            "configuration was not published in time"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    // The only instance dies; the backend empties out of the config.
    events_tx
        .send(ContainerEvent {
            kind: ContainerEventKind::Die,
            id: "c1".to_string(),
            inspected: None,
        })
        .await
        .unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        if let Ok(config) = tokio::fs::read_to_string(&config_path).await {
            if !config.contains("10.0.0.2") && !config.contains("backend A") {
                break;
            }
        }
        assert!(
            std::time::Instant::now() < deadline,
            "configuration was not re-published after removal"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
}

// Rendering is a pure function of the snapshot: equal inputs, identical
// bytes.
#[tokio::test]
async fn render_is_byte_identical_for_equal_snapshots() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings(tmp.path());
    let writer = ConfigWriter::new(&settings, 8080);

    let mut registry = DeploymentRegistry::new();
    let labels = DeploymentLabels::parse(&app_labels("20240101000000")).unwrap();
    registry.observe_start(labels, instance("c1", "10.0.0.2"));

    let first = writer.render(&reject_conflicts(&registry.snapshot()));
    let second = writer.render(&reject_conflicts(&registry.snapshot()));
    assert_eq!(first, second);
}
