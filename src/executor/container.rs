// Container Executor
// Runs a job inside an OCI container by driving the daemon API: pull the
// image (draining the stream fully), create and start the container, wait
// for it to stop, then demultiplex its logs into stdout and stderr. A
// non-empty stderr fails the job with the stderr text as the error.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config as BollardConfig, CreateContainerOptions, LogOutput, LogsOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use tokio_stream::StreamExt;

use crate::cancel::CancelToken;
use crate::context::{ContainerContext, ExecutionContext, CONTAINER_MOUNT_ROOT};
use crate::error::{Error, Result};
use crate::executor::{Executor, Job};
use crate::utils::convert_env;

/// One demultiplexed slice of container log output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Everything needed to create and run one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerCreateSpec {
    pub image: String,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub binds: Vec<String>,
    pub tty: bool,
    pub attach_stdin: bool,
}

/// Narrow client surface the executor drives; production uses the daemon
/// API, tests substitute an in-memory double.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    async fn image_pull(&self, image: &str) -> Result<()>;
    async fn container_create(&self, spec: ContainerCreateSpec) -> Result<String>;
    async fn container_start(&self, id: &str) -> Result<()>;
    async fn container_wait(&self, id: &str) -> Result<i64>;
    async fn container_logs(&self, id: &str) -> Result<Vec<LogChunk>>;
}

/// Daemon-API backed client.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    pub fn connect() -> Result<Self> {
        Docker::connect_with_local_defaults()
            .map(|docker| Self { docker })
            .map_err(|e| Error::ContainerCreate(e.to_string()))
    }
}

#[async_trait]
impl ContainerClient for DockerClient {
    async fn image_pull(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions::<String> {
            from_image: image.to_string(),
            ..Default::default()
        };
        // the pull is asynchronous; the stream must be drained fully for the
        // operation to complete
        let mut stream = Box::pin(self.docker.create_image(Some(options), None, None));
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| Error::ImagePull(e.to_string()))?;
            if let Some(status) = info.status {
                tracing::debug!(image, %status, "image pull");
            }
        }
        Ok(())
    }

    async fn container_create(&self, spec: ContainerCreateSpec) -> Result<String> {
        let config = BollardConfig::<String> {
            image: Some(spec.image),
            entrypoint: spec.entrypoint,
            cmd: Some(spec.cmd),
            env: Some(spec.env),
            working_dir: Some(spec.working_dir),
            tty: Some(spec.tty),
            attach_stdin: Some(spec.attach_stdin),
            host_config: Some(HostConfig {
                binds: Some(spec.binds),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map(|resp| resp.id)
            .map_err(|e| Error::ContainerCreate(e.to_string()))
    }

    async fn container_start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ContainerStart(e.to_string()))
    }

    async fn container_wait(&self, id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = Box::pin(self.docker.wait_container(id, Some(options)));
        match stream.next().await {
            Some(Ok(resp)) => Ok(resp.status_code),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Error::ContainerWait(e.to_string())),
            None => Err(Error::ContainerWait("wait stream ended unexpectedly".to_string())),
        }
    }

    async fn container_logs(&self, id: &str) -> Result<Vec<LogChunk>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = Box::pin(self.docker.logs(id, Some(options)));
        let mut chunks = Vec::new();
        while let Some(item) = stream.next().await {
            match item.map_err(|e| Error::ContainerLogs(e.to_string()))? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    chunks.push(LogChunk::Stdout(message.to_vec()));
                }
                LogOutput::StdErr { message } => {
                    chunks.push(LogChunk::Stderr(message.to_vec()));
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(chunks)
    }
}

pub struct ContainerExecutor {
    client: Box<dyn ContainerClient>,
    context: Arc<ExecutionContext>,
}

impl ContainerExecutor {
    pub fn new(context: Arc<ExecutionContext>) -> Result<Self> {
        Ok(Self {
            client: Box::new(DockerClient::connect()?),
            context,
        })
    }

    /// Swap the daemon client, used by tests.
    pub fn with_client(context: Arc<ExecutionContext>, client: Box<dyn ContainerClient>) -> Self {
        Self { client, context }
    }

    fn build_spec(&self, job: &Job, container: &ContainerContext) -> ContainerCreateSpec {
        let mut cmd = container.shell_args.clone();
        cmd.push(job.command.clone());

        let working_dir = container_workdir(&self.context.dir, job.dir.as_deref());

        // host paths must not leak into the image
        let mut env = job.env.string_map();
        for key in ["PATH", "HOME", "TMPDIR"] {
            env.remove(key);
        }
        env.insert("PWD".to_string(), working_dir.clone());

        ContainerCreateSpec {
            image: container.name.clone(),
            entrypoint: container.entrypoint.clone(),
            cmd,
            env: convert_env(&env),
            working_dir,
            binds: container.volumes().to_vec(),
            tty: job.interactive,
            attach_stdin: job.interactive,
        }
    }
}

#[async_trait]
impl Executor for ContainerExecutor {
    async fn execute(&mut self, cancel: &CancelToken, job: &Job) -> Result<Vec<u8>> {
        let container = self
            .context
            .container()
            .ok_or_else(|| Error::UnknownContext("container spec missing".to_string()))?
            .clone();

        let spec = self.build_spec(job, &container);
        tracing::debug!(entrypoint = ?spec.entrypoint, cmd = ?spec.cmd, "container job");

        with_cancel(cancel, self.client.image_pull(&container.name)).await?;
        let id = with_cancel(cancel, self.client.container_create(spec)).await?;
        with_cancel(cancel, self.client.container_start(&id)).await?;
        let status = with_cancel(cancel, self.client.container_wait(&id)).await?;
        tracing::debug!(container = %id, status, "container stopped");
        let chunks = with_cancel(cancel, self.client.container_logs(&id)).await?;

        let mut stdout_writer = job.stdout.clone();
        let mut captured = Vec::new();
        let mut stderr_buf: Vec<u8> = Vec::new();
        for chunk in chunks {
            match chunk {
                LogChunk::Stdout(bytes) => {
                    let _ = std::io::Write::write_all(&mut stdout_writer, &bytes);
                    captured.extend_from_slice(&bytes);
                }
                LogChunk::Stderr(bytes) => stderr_buf.extend_from_slice(&bytes),
            }
        }

        if !stderr_buf.is_empty() {
            let mut stderr_writer = job.stderr.clone();
            let _ = std::io::Write::write_all(&mut stderr_writer, &stderr_buf);
            return Err(Error::CommandFailed(
                String::from_utf8_lossy(&stderr_buf).into_owned(),
            ));
        }

        Ok(captured)
    }
}

async fn with_cancel<T, F>(cancel: &CancelToken, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Canceled),
        res = fut => res,
    }
}

/// Job working directories map under the fixed in-container mount root.
fn container_workdir(context_dir: &Path, job_dir: Option<&Path>) -> String {
    match job_dir {
        Some(dir) if dir != context_dir => {
            let suffix = dir.display().to_string();
            let suffix = suffix.trim_start_matches('/');
            if suffix.is_empty() {
                CONTAINER_MOUNT_ROOT.to_string()
            } else {
                format!("{CONTAINER_MOUNT_ROOT}/{suffix}")
            }
        }
        _ => CONTAINER_MOUNT_ROOT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Envfile;
    use crate::output::SafeWriter;
    use crate::variables::Variables;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MockClient {
        created: Mutex<Option<ContainerCreateSpec>>,
        logs: Vec<LogChunk>,
        fail_pull: bool,
        hang_on_wait: bool,
    }

    #[async_trait]
    impl ContainerClient for MockClient {
        async fn image_pull(&self, image: &str) -> Result<()> {
            if self.fail_pull {
                return Err(Error::ImagePull(format!("no such image {image}")));
            }
            Ok(())
        }

        async fn container_create(&self, spec: ContainerCreateSpec) -> Result<String> {
            *self.created.lock().unwrap() = Some(spec);
            Ok("cid-1".to_string())
        }

        async fn container_start(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn container_wait(&self, _id: &str) -> Result<i64> {
            if self.hang_on_wait {
                std::future::pending::<()>().await;
            }
            Ok(0)
        }

        async fn container_logs(&self, _id: &str) -> Result<Vec<LogChunk>> {
            Ok(self.logs.clone())
        }
    }

    fn container_context() -> Arc<ExecutionContext> {
        Arc::new(
            ExecutionContext::new(
                None,
                std::env::current_dir().unwrap(),
                Variables::from_map(std::env::vars()),
                Envfile::default(),
                Vec::new(),
                Vec::new(),
                Vec::new(),
                Vec::new(),
            )
            .with_container(ContainerContext::new("alpine:latest")),
        )
    }

    fn job(command: &str) -> Job {
        let mut job = Job::from_command(command);
        job.env = Variables::from_map([("FOO", "bar"), ("PATH", "/host/bin")]);
        job.stdout = SafeWriter::sink();
        job.stderr = SafeWriter::sink();
        job
    }

    #[tokio::test]
    async fn test_execute_builds_expected_spec() {
        let ctx = container_context();
        let client = Arc::new(MockClient {
            logs: vec![LogChunk::Stdout(b"hello\n".to_vec())],
            ..Default::default()
        });
        let mut executor =
            ContainerExecutor::with_client(ctx, Box::new(ArcClient(client.clone())));

        let job = job("echo hello");
        let out = executor.execute(&CancelToken::new(), &job).await.unwrap();
        assert_eq!(out, b"hello\n");
        assert_eq!(job.stdout.string(), "hello\n");

        let spec = client.created.lock().unwrap().clone().unwrap();
        assert_eq!(spec.image, "alpine:latest");
        assert_eq!(
            spec.cmd,
            vec!["sh".to_string(), "-c".to_string(), "echo hello".to_string()]
        );
        assert_eq!(spec.working_dir, CONTAINER_MOUNT_ROOT);
        assert!(spec.env.contains(&format!("PWD={CONTAINER_MOUNT_ROOT}")));
        assert!(spec.env.contains(&"FOO=bar".to_string()));
        assert!(!spec.env.iter().any(|e| e.starts_with("PATH=")));
        assert!(spec
            .binds
            .iter()
            .any(|b| b.ends_with(&format!(":{CONTAINER_MOUNT_ROOT}"))));
        assert!(!spec.binds.iter().any(|b| b.contains("docker.sock")));
        assert!(!spec.tty);
    }

    #[tokio::test]
    async fn test_stderr_fails_the_job() {
        let ctx = container_context();
        let client = MockClient {
            logs: vec![
                LogChunk::Stdout(b"partial\n".to_vec()),
                LogChunk::Stderr(b"boom\n".to_vec()),
            ],
            ..Default::default()
        };
        let mut executor = ContainerExecutor::with_client(ctx, Box::new(client));

        let job = job("failing");
        let err = executor.execute(&CancelToken::new(), &job).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed(msg) if msg.contains("boom")));
        assert!(job.stderr.string().contains("boom"));
        assert_eq!(job.stdout.string(), "partial\n");
    }

    #[tokio::test]
    async fn test_pull_failure_propagates() {
        let ctx = container_context();
        let client = MockClient {
            fail_pull: true,
            ..Default::default()
        };
        let mut executor = ContainerExecutor::with_client(ctx, Box::new(client));

        let err = executor
            .execute(&CancelToken::new(), &job("echo"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ImagePull(_)));
    }

    #[tokio::test]
    async fn test_cancel_aborts_wait() {
        let ctx = container_context();
        let client = MockClient {
            hang_on_wait: true,
            ..Default::default()
        };
        let mut executor = ContainerExecutor::with_client(ctx, Box::new(client));

        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = executor.execute(&cancel, &job("sleep 60")).await.unwrap_err();
        assert!(matches!(err, Error::Canceled));
    }

    #[test]
    fn test_container_workdir_mapping() {
        let ctx_dir = PathBuf::from("/work");
        assert_eq!(container_workdir(&ctx_dir, None), CONTAINER_MOUNT_ROOT);
        assert_eq!(
            container_workdir(&ctx_dir, Some(Path::new("/work"))),
            CONTAINER_MOUNT_ROOT
        );
        assert_eq!(
            container_workdir(&ctx_dir, Some(Path::new("/work/sub"))),
            format!("{CONTAINER_MOUNT_ROOT}/work/sub")
        );
        assert_eq!(
            container_workdir(&ctx_dir, Some(Path::new("sub"))),
            format!("{CONTAINER_MOUNT_ROOT}/sub")
        );
    }

    /// Forwards the client trait through an Arc so tests can inspect state
    /// after handing the client to the executor.
    struct ArcClient(Arc<MockClient>);

    #[async_trait]
    impl ContainerClient for ArcClient {
        async fn image_pull(&self, image: &str) -> Result<()> {
            self.0.image_pull(image).await
        }
        async fn container_create(&self, spec: ContainerCreateSpec) -> Result<String> {
            self.0.container_create(spec).await
        }
        async fn container_start(&self, id: &str) -> Result<()> {
            self.0.container_start(id).await
        }
        async fn container_wait(&self, id: &str) -> Result<i64> {
            self.0.container_wait(id).await
        }
        async fn container_logs(&self, id: &str) -> Result<Vec<LogChunk>> {
            self.0.container_logs(id).await
        }
    }
}
