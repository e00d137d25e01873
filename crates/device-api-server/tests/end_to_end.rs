//! Drives a real server on a temporary Unix socket through the client library.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use api_types::Condition;
use api_types::ConditionStatus;
use api_types::ConditionType;
use api_types::Gpu;
use device_api_client::watch::WatchEvent;
use device_api_client::DialOptions;
use device_api_client::GpuClient;
use device_api_client::ResourceEventHandler;
use device_api_client::SharedInformerFactory;
use device_api_server::config::ServerConfig;
use device_api_server::server::default_providers;
use device_api_server::server::DeviceApiServer;
use device_api_server::server::ListenAddresses;
use similar_asserts::assert_eq;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

const NODE: &str = "worker-node-1";
const UUID_1: &str = "GPU-00000000-0000-0000-0000-000000000001";
const UUID_2: &str = "GPU-00000000-0000-0000-0000-000000000002";

struct TestServer {
    client: GpuClient,
    addresses: ListenAddresses,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(customise: impl FnOnce(&mut ServerConfig)) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = ServerConfig::local(NODE, dir.path().join("run/device-api.sock"));
        config.progress_notify_interval = None;
        customise(&mut config);

        let server = DeviceApiServer::new(config, default_providers());
        let mut ready = server.ready_signal();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = server.run(shutdown).await {
                    panic!("server failed: {e:?}");
                }
            }
        });

        let addresses = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(addresses) = ready.borrow_and_update().clone() {
                    return addresses;
                }
                ready.changed().await.expect("server still running");
            }
        })
        .await
        .expect("server ready in time");

        let client = GpuClient::connect(&DialOptions::default().with_socket(addresses.socket.clone()))
            .await
            .expect("connect");
        Self {
            client,
            addresses,
            shutdown,
            task,
            _dir: dir,
        }
    }

    async fn stop(self) -> PathBuf {
        self.shutdown.cancel();
        self.task.await.expect("server task");
        self.addresses.socket
    }
}

fn named_gpu(name: &str, uuid: &str) -> Gpu {
    let mut gpu = Gpu::with_generate_name("", NODE, uuid);
    gpu.metadata.name = name.to_string();
    gpu
}

fn rv(gpu: &Gpu) -> u64 {
    gpu.metadata.resource_version.parse().expect("numeric resource version")
}

#[test_log::test(tokio::test)]
async fn create_and_fetch() {
    let server = TestServer::start().await;

    let created = server
        .client
        .create(Gpu::with_generate_name("some-prefix-", NODE, UUID_1))
        .await
        .expect("create");
    let fetched = server
        .client
        .get("", &created.metadata.name)
        .await
        .expect("get");

    assert_eq!(created.metadata.name, "some-prefix-89ebd4226844");
    assert!(!created.metadata.uid.is_empty());
    assert_eq!(created.metadata.generation, 1);
    assert!(rv(&created) > 0);
    assert_eq!(fetched.spec, created.spec);
    assert_eq!(fetched.metadata.uid, created.metadata.uid);

    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn missing_gpu_is_not_found() {
    let server = TestServer::start().await;

    let err = server
        .client
        .get("", "gpu-missing")
        .await
        .expect_err("not created");

    assert!(err.current_context().is_not_found());
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn concurrent_updates_conflict() {
    let server = TestServer::start().await;
    let created = server
        .client
        .create(named_gpu("gpu-1", UUID_1))
        .await
        .expect("create");
    let r = rv(&created);

    let mut first = created.clone();
    first.metadata.labels = BTreeMap::from([("pool".to_string(), "a".to_string())]);
    let mut second = created.clone();
    second.metadata.labels = BTreeMap::from([("pool".to_string(), "b".to_string())]);

    let updated = server.client.update(first).await.expect("first update");
    let conflict = server
        .client
        .update(second)
        .await
        .expect_err("second update is stale");

    assert_eq!(rv(&updated), r + 1);
    assert!(conflict.current_context().is_conflict());

    let mut retry = server.client.get("", "gpu-1").await.expect("re-read");
    assert_eq!(rv(&retry), r + 1);
    retry.metadata.labels.insert("pool".to_string(), "b".to_string());
    let retried = server.client.update(retry).await.expect("retry");
    assert_eq!(rv(&retried), r + 2);
    assert_eq!(retried.metadata.generation, 1);

    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn watch_delivers_snapshot_then_live_edit() {
    let server = TestServer::start().await;
    let created = server
        .client
        .create(named_gpu("gpu-1", UUID_1))
        .await
        .expect("create");

    let mut watcher = server.client.watch("", "0").await;
    let snapshot = watcher.recv().await.expect("snapshot event");

    let mut edit = created.clone();
    edit.metadata.labels.insert("health".to_string(), "checked".to_string());
    server.client.update(edit).await.expect("update");
    let live = watcher.recv().await.expect("live event");

    match snapshot {
        WatchEvent::Added(gpu) => {
            assert_eq!(gpu.metadata.name, "gpu-1");
            assert_eq!(rv(&gpu), rv(&created));
        }
        other => panic!("expected ADDED, got {other:?}"),
    }
    match live {
        WatchEvent::Modified(gpu) => {
            assert_eq!(gpu.metadata.name, "gpu-1");
            assert_eq!(rv(&gpu), rv(&created) + 1);
        }
        other => panic!("expected MODIFIED, got {other:?}"),
    }

    watcher.stop();
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn watch_from_compacted_revision_expires() {
    let server = TestServer::start_with(|config| {
        config.storage.compaction_interval = Some(Duration::from_millis(50));
        config.storage.compaction_batch_size = 1_000_000;
    })
    .await;
    let mut gpu = server
        .client
        .create(named_gpu("gpu-1", UUID_1))
        .await
        .expect("create");
    for i in 0..1010 {
        gpu.metadata.labels.insert("step".to_string(), i.to_string());
        gpu = server.client.update(gpu).await.expect("update");
    }

    let error = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let mut watcher = server.client.watch("", "1").await;
            match watcher.recv().await {
                Some(WatchEvent::Error(e)) => return e,
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await
    .expect("history compacted in time");

    assert!(error.is_expired());
    assert_eq!(error.code, 410);
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn colliding_hardware_gets_distinct_names() {
    let server = TestServer::start().await;

    let a = server
        .client
        .create(Gpu::with_generate_name("a-", NODE, UUID_1))
        .await
        .expect("create a");
    let b = server
        .client
        .create(Gpu::with_generate_name("b-", NODE, UUID_1))
        .await
        .expect("create b");
    let again = server
        .client
        .create(Gpu::with_generate_name("a-", NODE, UUID_1))
        .await
        .expect_err("same derived name");

    assert_ne!(a.metadata.name, b.metadata.name);
    assert_eq!(a.metadata.name[2..], b.metadata.name[2..]);
    assert!(again.current_context().is_already_exists());
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn invalid_gpu_is_rejected() {
    let server = TestServer::start().await;

    let err = server
        .client
        .create(named_gpu("gpu-1", "not-a-uuid"))
        .await
        .expect_err("invalid uuid");

    assert!(err.current_context().is_invalid());
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn update_keeps_generated_name_canonical() {
    let server = TestServer::start().await;
    let created = server
        .client
        .create(Gpu::with_generate_name("some-prefix-", NODE, UUID_1))
        .await
        .expect("create");

    let mut swapped = created.clone();
    swapped.metadata.generate_name.clear();
    swapped.spec.uuid = UUID_2.to_string();
    let err = server
        .client
        .update(swapped)
        .await
        .expect_err("name no longer matches uuid");
    let stored = server
        .client
        .get("", &created.metadata.name)
        .await
        .expect("get");

    assert!(err.current_context().is_invalid());
    assert_eq!(stored.spec.uuid, UUID_1);
    assert_eq!(stored.metadata.resource_version, created.metadata.resource_version);
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn unknown_condition_status_is_rejected() {
    let server = TestServer::start().await;
    let maybe = || Condition {
        type_: ConditionType::Ready.to_string(),
        status: ConditionStatus::Other("Maybe".to_string()),
        reason: "DriverReady".to_string(),
        ..Default::default()
    };

    let mut fresh = named_gpu("gpu-1", UUID_1);
    fresh.status.conditions.push(maybe());
    let on_create = server
        .client
        .create(fresh)
        .await
        .expect_err("create with unknown status");

    let mut created = server
        .client
        .create(named_gpu("gpu-1", UUID_1))
        .await
        .expect("create");
    created.status.conditions.push(maybe());
    let on_update = server
        .client
        .update(created)
        .await
        .expect_err("update with unknown status");

    assert!(on_create.current_context().is_invalid());
    assert!(on_update.current_context().is_invalid());
    server.stop().await;
}

struct Events(mpsc::UnboundedSender<String>);

impl ResourceEventHandler<Gpu> for Events {
    fn on_add(&self, obj: &Gpu, _is_initial_list: bool) {
        let _ = self.0.send(format!("add {}", obj.metadata.name));
    }

    fn on_update(&self, _old: &Gpu, new: &Gpu) {
        let _ = self.0.send(format!("update {}", new.metadata.name));
    }

    fn on_delete(&self, obj: &Gpu) {
        let _ = self.0.send(format!("delete {}", obj.metadata.name));
    }
}

async fn next(events: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("event in time")
        .expect("handler alive")
}

#[test_log::test(tokio::test)]
async fn informer_tracks_server_state() {
    // Arrange
    let server = TestServer::start().await;
    server
        .client
        .create(named_gpu("gpu-1", UUID_1))
        .await
        .expect("create");
    let factory = SharedInformerFactory::new(server.client.clone(), None);
    let gpus = factory.gpus();
    let (tx, mut events) = mpsc::unbounded_channel();
    gpus.informer().add_event_handler(Events(tx));
    let cancel = CancellationToken::new();

    // Act
    factory.start(&cancel);
    let synced = factory.wait_for_cache_sync(&cancel).await;
    let second = server
        .client
        .create(named_gpu("gpu-2", UUID_2))
        .await
        .expect("create second");
    server.client.delete("", "gpu-1").await.expect("delete");

    // Assert
    assert_eq!(synced.get("gpus"), Some(&true));
    assert_eq!(next(&mut events).await, "add gpu-1");
    assert_eq!(next(&mut events).await, "add gpu-2");
    assert_eq!(next(&mut events).await, "delete gpu-1");
    let lister = gpus.lister();
    let cached = lister.get("gpu-2").expect("cached");
    assert_eq!(cached.metadata.uid, second.metadata.uid);
    assert!(lister.get("gpu-1").is_err());
    assert!(
        gpus.informer()
            .last_sync_resource_version()
            .parse::<u64>()
            .expect("numeric")
            > rv(&second)
    );

    factory.shutdown().await;
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn health_and_metrics_endpoints() {
    let server = TestServer::start().await;
    server
        .client
        .list("")
        .await
        .expect("list to produce a metric sample");

    let mut health = HealthClient::new(
        tonic::transport::Endpoint::new(format!("http://{}", server.addresses.health_probe))
            .expect("health endpoint")
            .connect()
            .await
            .expect("health endpoint"),
    );
    let status = health
        .check(HealthCheckRequest {
            service: "nvidia.device.v1alpha1.GpuService".to_string(),
        })
        .await
        .expect("health check")
        .into_inner()
        .status;

    let mut stream = tokio::net::TcpStream::connect(server.addresses.metrics)
        .await
        .expect("metrics endpoint");
    stream
        .write_all(b"GET /metrics HTTP/1.0\r\nHost: localhost\r\n\r\n")
        .await
        .expect("request");
    let mut body = String::new();
    stream.read_to_string(&mut body).await.expect("response");

    assert_eq!(status, ServingStatus::Serving as i32);
    assert!(body.starts_with("HTTP/1.0 200") || body.starts_with("HTTP/1.1 200"));
    assert!(body.contains("device_api_grpc_requests_total"));
    assert!(body.contains("method=\"ListGpus\""));

    let socket = server.stop().await;
    assert!(!socket.exists());
}

#[test_log::test(tokio::test)]
async fn second_server_on_live_socket_fails() {
    let server = TestServer::start().await;
    let socket = server.addresses.socket.clone();

    let mut config = ServerConfig::local(NODE, socket.clone());
    config.progress_notify_interval = None;
    let result = DeviceApiServer::new(config, default_providers())
        .run(CancellationToken::new())
        .await;

    assert!(result.is_err());
    assert!(socket.exists());
    let listed = server.client.list("").await.expect("first server still serving");
    assert!(listed.items.is_empty());
    server.stop().await;
}
