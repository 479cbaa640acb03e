//! Tests for the runtime-backed driver.
//!
//! Most tests drive `DockerDriver` through an in-memory `ContainerClient`
//! whose "container filesystem" is a host temp dir streamed out the way
//! `docker cp <id>:<path> -` does. One live test talks to a real runtime
//! and skips itself unless `STRUCTEST_LIVE_IMAGE` is set and the CLI works.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use structest::client::ArchiveStream;
use structest::{
    Command, ContainerClient, ContainerSpec, DockerCli, DockerConfig, DockerDriver, Driver,
    DriverGuard, DriverState, EnvVar, Error, ExecResult, FileKind, InstanceStatus, Result,
};
use tempfile::TempDir;

// =============================================================================
// Fake Client
// =============================================================================

#[derive(Default)]
struct Calls {
    started: Vec<ContainerSpec>,
    inspected: usize,
    execs: Vec<(Vec<EnvVar>, Vec<String>)>,
    removed: Vec<String>,
    removed_blocking: Vec<String>,
}

struct FakeClient {
    fs: TempDir,
    statuses: Mutex<VecDeque<InstanceStatus>>,
    calls: Mutex<Calls>,
}

impl FakeClient {
    fn new() -> Arc<Self> {
        let fs = tempfile::tempdir().unwrap();
        let root = fs.path();
        fs::create_dir_all(root.join("etc/ssl/certs")).unwrap();
        fs::write(root.join("etc/hostname"), "container\n").unwrap();
        fs::write(root.join("etc/os-release"), "ID=fake\n").unwrap();
        fs::write(root.join("etc/ssl/certs/ca.pem"), "---").unwrap();
        fs::write(root.join("blob"), [0u8, 1, 2, 254, 255]).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("hostname", root.join("etc/name")).unwrap();

        Arc::new(Self {
            fs,
            statuses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Calls::default()),
        })
    }

    fn with_statuses(statuses: &[InstanceStatus]) -> Arc<Self> {
        let client = Self::new();
        client.statuses.lock().unwrap().extend(statuses.iter().cloned());
        client
    }

    fn container_env(&self) -> Vec<EnvVar> {
        let calls = self.calls.lock().unwrap();
        calls.started.last().map(|s| s.env.clone()).unwrap_or_default()
    }

    fn host_path(&self, path: &str) -> std::path::PathBuf {
        self.fs.path().join(path.trim_start_matches('/'))
    }
}

/// In-memory copy stream; `finish` reports the copy's exit.
struct MemCopy {
    data: Cursor<Vec<u8>>,
    missing: Option<String>,
}

impl Read for MemCopy {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.data.read(buf)
    }
}

impl ArchiveStream for MemCopy {
    fn finish(self: Box<Self>) -> Result<()> {
        match self.missing {
            Some(path) => Err(Error::NotFound { path }),
            None => Ok(()),
        }
    }
}

fn append_tree(
    builder: &mut tar::Builder<Vec<u8>>,
    host: &Path,
    name: &str,
    follow: bool,
) -> std::io::Result<()> {
    let meta = if follow {
        fs::metadata(host)?
    } else {
        fs::symlink_metadata(host)?
    };
    let mut header = tar::Header::new_gnu();
    header.set_metadata(&meta);

    if meta.is_dir() {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        builder.append_data(&mut header, format!("{}/", name), std::io::empty())?;
        for child in fs::read_dir(host)? {
            let child = child?;
            let child_name = format!("{}/{}", name, child.file_name().to_string_lossy());
            append_tree(builder, &child.path(), &child_name, false)?;
        }
    } else if meta.file_type().is_symlink() {
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, name, fs::read_link(host)?)?;
    } else {
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, name, fs::File::open(host)?)?;
    }
    Ok(())
}

#[async_trait]
impl ContainerClient for FakeClient {
    fn name(&self) -> &str {
        "fake"
    }

    async fn run_detached(&self, spec: &ContainerSpec) -> Result<String> {
        let mut calls = self.calls.lock().unwrap();
        calls.started.push(spec.clone());
        Ok(format!("fake-{}", calls.started.len()))
    }

    async fn inspect(&self, _id: &str) -> Result<InstanceStatus> {
        self.calls.lock().unwrap().inspected += 1;
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(InstanceStatus::Running))
    }

    async fn exec(&self, id: &str, env: &[EnvVar], command: &[String]) -> Result<ExecResult> {
        self.calls
            .lock()
            .unwrap()
            .execs
            .push((env.to_vec(), command.to_vec()));

        let lookup = |key: &str| {
            env.iter()
                .rev()
                .chain(self.container_env().iter().rev())
                .find(|v| v.key == key)
                .map(|v| v.value.clone())
        };
        let ok = |stdout: String| ExecResult {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        };

        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        Ok(match args.as_slice() {
            ["exit", code] => ExecResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: code.parse().unwrap(),
            },
            ["echo", rest @ ..] => ok(format!("{}\n", rest.join(" "))),
            ["printenv", key] => match lookup(key) {
                Some(value) => ok(format!("{}\n", value)),
                None => ExecResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 1,
                },
            },
            ["touch", path] => {
                fs::write(self.host_path(path), "").unwrap();
                ok(String::new())
            }
            ["vanish"] => {
                return Err(Error::ExecFailed {
                    container: id.to_string(),
                    reason: "No such container".to_string(),
                });
            }
            _ => ExecResult {
                stdout: String::new(),
                stderr: "executable file not found in $PATH\n".to_string(),
                exit_code: 127,
            },
        })
    }

    fn copy_from(
        &self,
        _id: &str,
        path: &str,
        follow_links: bool,
    ) -> Result<Box<dyn ArchiveStream>> {
        let host = self.host_path(path);
        if fs::symlink_metadata(&host).is_err() {
            return Ok(Box::new(MemCopy {
                data: Cursor::new(Vec::new()),
                missing: Some(path.to_string()),
            }));
        }

        let name = match Path::new(path).file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => ".".to_string(),
        };
        let mut builder = tar::Builder::new(Vec::new());
        append_tree(&mut builder, &host, &name, follow_links)?;
        Ok(Box::new(MemCopy {
            data: Cursor::new(builder.into_inner()?),
            missing: None,
        }))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.calls.lock().unwrap().removed.push(id.to_string());
        Ok(())
    }

    fn remove_blocking(&self, id: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .removed_blocking
            .push(id.to_string());
        Ok(())
    }
}

fn config() -> DockerConfig {
    DockerConfig {
        poll_interval_ms: 1,
        ..Default::default()
    }
}

fn driver(client: &Arc<FakeClient>) -> DockerDriver {
    DockerDriver::with_client("alpine:3.20", client.clone(), config()).unwrap()
}

async fn ready(client: &Arc<FakeClient>) -> DockerDriver {
    let mut driver = driver(client);
    driver.setup(&[], &[]).await.unwrap();
    driver
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_setup_then_destroy() {
    let client = FakeClient::new();
    let mut driver = driver(&client);
    assert_eq!(driver.name(), "docker");
    assert_eq!(driver.image(), "alpine:3.20");

    driver
        .setup(&[EnvVar::new("MODE", "test")], &[])
        .await
        .unwrap();
    assert_eq!(driver.state(), DriverState::Ready);
    assert_eq!(driver.container_id(), Some("fake-1"));

    {
        let calls = client.calls.lock().unwrap();
        let spec = &calls.started[0];
        assert_eq!(spec.image, "alpine:3.20");
        assert!(spec.name.starts_with("structest-"));
        assert_eq!(spec.entrypoint, vec!["tail", "-f", "/dev/null"]);
        assert_eq!(spec.env, vec![EnvVar::new("MODE", "test")]);
    }

    driver.destroy().await.unwrap();
    assert_eq!(driver.state(), DriverState::Destroyed);
    assert_eq!(client.calls.lock().unwrap().removed, vec!["fake-1"]);
    drop(driver);
    assert!(client.calls.lock().unwrap().removed_blocking.is_empty());
}

#[tokio::test]
async fn test_waits_until_running() {
    let client = FakeClient::with_statuses(&[
        InstanceStatus::Starting,
        InstanceStatus::Other("created".to_string()),
        InstanceStatus::Running,
    ]);
    let _driver = ready(&client).await;
    assert_eq!(client.calls.lock().unwrap().inspected, 3);
}

#[tokio::test]
async fn test_container_exiting_during_start() {
    let client = FakeClient::with_statuses(&[InstanceStatus::Exited(1)]);
    let mut driver = driver(&client);

    let err = driver.setup(&[], &[]).await.unwrap_err();
    assert!(matches!(err, Error::StartFailed { .. }), "got {:?}", err);
    assert_eq!(driver.state(), DriverState::Created);

    // No second container is started after a failed setup.
    assert!(matches!(
        driver.setup(&[], &[]).await,
        Err(Error::InvalidState { .. })
    ));
    assert_eq!(client.calls.lock().unwrap().started.len(), 1);

    // The started container is still cleaned up.
    driver.destroy().await.unwrap();
    assert_eq!(client.calls.lock().unwrap().removed, vec!["fake-1"]);
}

#[tokio::test]
async fn test_start_timeout() {
    let client = FakeClient::with_statuses(&vec![InstanceStatus::Starting; 10_000]);
    let mut driver = DockerDriver::with_client(
        "alpine:3.20",
        client.clone(),
        DockerConfig {
            start_timeout_secs: 1,
            poll_interval_ms: 50,
            ..Default::default()
        },
    )
    .unwrap();

    let err = driver.setup(&[], &[]).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "got {:?}", err);
}

#[tokio::test]
async fn test_operations_require_setup() {
    let client = FakeClient::new();
    let driver = driver(&client);
    assert!(matches!(
        driver.stat_file("/etc").await,
        Err(Error::NotReady { .. })
    ));
    assert!(matches!(
        driver
            .process_command(&[], &Command::from(["exit", "0"]))
            .await,
        Err(Error::NotReady { .. })
    ));
}

#[tokio::test]
async fn test_destroy_twice_is_invalid() {
    let client = FakeClient::new();
    let mut driver = ready(&client).await;
    driver.destroy().await.unwrap();
    assert!(matches!(
        driver.destroy().await,
        Err(Error::InvalidState { .. })
    ));
    assert_eq!(client.calls.lock().unwrap().removed.len(), 1);
}

#[tokio::test]
async fn test_drop_removes_container() {
    let client = FakeClient::new();
    let driver = ready(&client).await;
    drop(driver);
    assert_eq!(client.calls.lock().unwrap().removed_blocking, vec!["fake-1"]);
}

#[tokio::test]
async fn test_guard_release() {
    let client = FakeClient::new();
    let mut guard = DriverGuard::new(Box::new(driver(&client)));
    guard.setup(&[], &[]).await.unwrap();
    assert_eq!(
        guard.read_file("/etc/hostname").await.unwrap(),
        b"container\n"
    );
    guard.release().await.unwrap();
    let calls = client.calls.lock().unwrap();
    assert_eq!(calls.removed, vec!["fake-1"]);
    assert!(calls.removed_blocking.is_empty());
}

#[test]
fn test_invalid_image_reference() {
    let client = FakeClient::new();
    let err = DockerDriver::with_client("", client, config()).err().unwrap();
    assert!(matches!(err, Error::InvalidImageReference { .. }));
}

// =============================================================================
// Command Execution Tests
// =============================================================================

#[tokio::test]
async fn test_exit_codes_pass_through() {
    let client = FakeClient::new();
    let driver = ready(&client).await;
    for code in ["0", "1", "3", "42", "255"] {
        let result = driver
            .process_command(&[], &Command::from(["exit", code]))
            .await
            .unwrap();
        assert_eq!(result.exit_code.to_string(), code);
    }
}

#[tokio::test]
async fn test_env_is_scoped_to_one_call() {
    let client = FakeClient::new();
    let mut driver = driver(&client);
    driver
        .setup(&[EnvVar::new("BASE", "setup")], &[])
        .await
        .unwrap();

    let printenv = |key: &str| Command::from(["printenv", key]);
    let with = driver
        .process_command(&[EnvVar::new("FOO", "bar")], &printenv("FOO"))
        .await
        .unwrap();
    assert_eq!(with.stdout, "bar\n");

    let without = driver.process_command(&[], &printenv("FOO")).await.unwrap();
    assert_eq!(without.exit_code, 1);

    let base = driver.process_command(&[], &printenv("BASE")).await.unwrap();
    assert_eq!(base.stdout, "setup\n");
}

#[tokio::test]
async fn test_command_fragments_passed_verbatim() {
    let client = FakeClient::new();
    let driver = ready(&client).await;
    let command = Command::from(["echo", "a  b", "$HOME", "'q'"]);
    let result = driver.process_command(&[], &command).await.unwrap();
    assert_eq!(result.stdout, "a  b $HOME 'q'\n");

    let calls = client.calls.lock().unwrap();
    assert_eq!(calls.execs.last().unwrap().1, command.parts());
    assert_eq!(
        driver.exec_prefix(),
        vec!["fake".to_string(), "exec".to_string(), "fake-1".to_string()]
    );
}

#[tokio::test]
async fn test_dispatch_failure_is_error() {
    let client = FakeClient::new();
    let driver = ready(&client).await;
    let err = driver
        .process_command(&[], &Command::from(["vanish"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExecFailed { .. }));

    let missing = driver
        .process_command(&[], &Command::from(["nope"]))
        .await
        .unwrap();
    assert_eq!(missing.exit_code, 127);
}

#[tokio::test]
async fn test_setup_commands() {
    let client = FakeClient::new();
    let mut driver = driver(&client);
    driver
        .setup(&[], &[Command::from(["touch", "/marker"])])
        .await
        .unwrap();
    assert!(driver.stat_file("/marker").await.unwrap().is_file());

    let mut failing = DockerDriver::with_client("alpine:3.20", client.clone(), config()).unwrap();
    let err = failing
        .setup(&[], &[Command::from(["exit", "4"])])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::SetupCommandFailed { exit_code: 4, .. }
    ));
    failing.destroy().await.unwrap();
}

// =============================================================================
// Filesystem Inspection Tests
// =============================================================================

#[tokio::test]
async fn test_read_file_exact_bytes() {
    let client = FakeClient::new();
    let driver = ready(&client).await;
    assert_eq!(
        driver.read_file("/blob").await.unwrap(),
        vec![0u8, 1, 2, 254, 255]
    );
}

#[tokio::test]
async fn test_missing_path_is_not_found_everywhere() {
    let client = FakeClient::new();
    let driver = ready(&client).await;
    assert!(driver.stat_file("/nope").await.unwrap_err().is_not_found());
    assert!(driver.read_file("/nope").await.unwrap_err().is_not_found());
    assert!(driver.read_dir("/nope").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_read_dir_immediate_children_sorted() {
    let client = FakeClient::new();
    let driver = ready(&client).await;

    let entries = driver.read_dir("/etc").await.unwrap();
    let names: Vec<&str> = entries.iter().map(|i| i.name.as_str()).collect();
    #[cfg(unix)]
    assert_eq!(names, vec!["hostname", "name", "os-release", "ssl"]);
    assert!(entries.iter().find(|i| i.name == "ssl").unwrap().is_dir());

    let root: Vec<String> = driver
        .read_dir("/")
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.name)
        .collect();
    assert_eq!(root, vec!["blob", "etc"]);
}

#[tokio::test]
async fn test_read_dir_on_file() {
    let client = FakeClient::new();
    let driver = ready(&client).await;
    let err = driver.read_dir("/etc/hostname").await.unwrap_err();
    assert!(err.is_not_a_directory(), "got {:?}", err);
}

#[tokio::test]
async fn test_read_file_on_directory() {
    let client = FakeClient::new();
    let driver = ready(&client).await;
    assert!(matches!(
        driver.read_file("/etc").await,
        Err(Error::IsADirectory { .. })
    ));
}

#[tokio::test]
async fn test_stat_metadata() {
    let client = FakeClient::new();
    let driver = ready(&client).await;

    let info = driver.stat_file("/etc/hostname").await.unwrap();
    assert_eq!(info.name, "hostname");
    assert_eq!(info.size, 10);
    assert!(info.is_file());

    let dir = driver.stat_file("/etc/ssl").await.unwrap();
    assert!(dir.is_dir());
    assert_eq!(dir.size, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlink_handling() {
    let client = FakeClient::new();
    let driver = ready(&client).await;

    let link = driver.stat_file("/etc/name").await.unwrap();
    assert_eq!(link.kind, FileKind::Symlink);
    assert_eq!(
        driver.read_file("/etc/name").await.unwrap(),
        b"container\n"
    );
}

// =============================================================================
// Live Runtime Test
// =============================================================================

#[tokio::test]
async fn test_live_docker_roundtrip() {
    let Ok(image) = std::env::var("STRUCTEST_LIVE_IMAGE") else {
        eprintln!("STRUCTEST_LIVE_IMAGE not set, skipping");
        return;
    };
    let cli = DockerCli::new("docker", Duration::from_secs(120));
    if !cli.is_available() {
        eprintln!("docker CLI not available, skipping");
        return;
    }

    let mut driver =
        DockerDriver::with_client(&image, Arc::new(cli), DockerConfig::default()).unwrap();
    driver.setup(&[], &[]).await.unwrap();

    let result = driver
        .process_command(
            &[EnvVar::new("FOO", "bar")],
            &Command::from(["sh", "-c", "echo $FOO; exit 3"]),
        )
        .await
        .unwrap();
    assert_eq!(result.stdout, "bar\n");
    assert_eq!(result.exit_code, 3);

    assert!(driver.stat_file("/etc").await.unwrap().is_dir());
    assert!(driver.stat_file("/no/such/path").await.unwrap_err().is_not_found());
    assert!(!driver.read_dir("/etc").await.unwrap().is_empty());

    driver.destroy().await.unwrap();
}
