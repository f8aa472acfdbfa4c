// Container Context
// Image, entrypoint, shell and volume configuration for tasks executed inside
// an OCI container. User-supplied arguments are sanitized: nothing may mount
// the Docker socket or escalate with --privileged unless DinD is enabled.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Everything inside the container is relative to this mount root.
pub const CONTAINER_MOUNT_ROOT: &str = "/conveyor";

const DOCKER_SOCKET_BIND: &str = "/var/run/docker.sock:/var/run/docker.sock";
const FORBIDDEN_PAIR_FRAGMENTS: [&str; 1] = ["docker.sock:"];
const FORBIDDEN_SWITCHES: [&str; 1] = ["--privileged"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerContext {
    /// Image reference: `<name>`, `<name>:<tag>` or `<name>@<digest>`.
    pub name: String,
    /// Overrides the image ENTRYPOINT when set.
    pub entrypoint: Option<Vec<String>>,
    /// Mount the Docker socket into the container. Highly discouraged.
    pub enable_dind: bool,
    /// Shell invocation prepended to the command, `["sh", "-c"]` by default.
    pub shell_args: Vec<String>,
    /// Additional sanitized user arguments.
    pub container_args: Vec<String>,
    volumes: Vec<String>,
}

impl ContainerContext {
    pub fn new(name: impl Into<String>) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            name: name.into(),
            entrypoint: None,
            enable_dind: false,
            shell_args: vec!["sh".to_string(), "-c".to_string()],
            container_args: Vec::new(),
            volumes: vec![format!("{}:{}", cwd.display(), CONTAINER_MOUNT_ROOT)],
        }
    }

    pub fn with_entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = Some(entrypoint);
        self
    }

    /// Use a custom shell; the args must include the flag that accepts the
    /// command as a string (`-c` for POSIX shells).
    pub fn with_shell(mut self, shell: impl Into<String>, args: Vec<String>) -> Self {
        let mut shell_args = vec![shell.into()];
        shell_args.extend(args);
        self.shell_args = shell_args;
        self
    }

    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volumes.push(volume.into());
        self
    }

    pub fn with_dind(mut self) -> Self {
        self.enable_dind = true;
        self.volumes.push(DOCKER_SOCKET_BIND.to_string());
        self
    }

    /// Sanitize user arguments and pull any `-v`/`--volume` pairs out into
    /// the volume list; the remainder is kept verbatim.
    pub fn with_container_args(mut self, args: Vec<String>) -> Self {
        let sanitized = sanitize_container_args(&args);
        let mut rest = Vec::new();
        let mut iter = sanitized.into_iter().peekable();
        while let Some(arg) = iter.next() {
            if arg == "-v" || arg == "--volume" {
                if let Some(value) = iter.next() {
                    self.volumes.push(value);
                }
            } else if let Some(value) = arg
                .strip_prefix("--volume=")
                .or_else(|| arg.strip_prefix("-v="))
            {
                self.volumes.push(value.to_string());
            } else {
                rest.push(arg);
            }
        }
        self.container_args = rest;
        self
    }

    /// Host bind mounts for the container.
    pub fn volumes(&self) -> &[String] {
        &self.volumes
    }
}

/// Remove forbidden arguments: any value mentioning the Docker socket drops
/// both the flag and the value; forbidden switches drop themselves.
pub fn sanitize_container_args(args: &[String]) -> Vec<String> {
    if args.is_empty() {
        return Vec::new();
    }

    let mut forbidden: Vec<usize> = Vec::new();

    for (idx, arg) in args.iter().enumerate() {
        if FORBIDDEN_PAIR_FRAGMENTS.iter().any(|f| arg.contains(f)) {
            if idx > 0 {
                forbidden.push(idx - 1);
            }
            forbidden.push(idx);
        }
        if FORBIDDEN_SWITCHES.iter().any(|s| s == arg) {
            forbidden.push(idx);
        }
    }

    args.iter()
        .enumerate()
        .filter(|(idx, _)| !forbidden.contains(idx))
        .map(|(_, arg)| arg.clone())
        .collect()
}
