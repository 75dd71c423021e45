//! In-memory stand-ins for the docker CLI and the source provider.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::{DockyardConfig, ImagesConfig, NginxConfig};
use crate::deployment::{Manifest, Service};
use crate::error::{EngineError, EngineResult};
use crate::source::{SourceProvider, WebhookService};
use crate::system::{render_command, CommandOutput, CommandRunner, ShellError};

#[derive(Debug, Default)]
struct FakeState {
    commands: Vec<(String, Vec<String>)>,
    /// Running container name to its published host ports.
    running: BTreeMap<String, Vec<u16>>,
    failing: HashSet<String>,
    fail_builds: bool,
}

/// Records every command and simulates the docker daemon's running set.
#[derive(Debug, Default)]
pub struct FakeRunner {
    state: Mutex<FakeState>,
}

fn failed(program: &str, args: &[String], stderr: impl Into<String>) -> ShellError {
    ShellError::Failed {
        command: render_command(program, args),
        code: Some(1),
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
    args.windows(2)
        .filter(|pair| pair[0] == flag)
        .map(|pair| pair[1].as_str())
        .collect()
}

fn host_port(publish: &str) -> Option<u16> {
    publish.split(':').nth(1)?.parse().ok()
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("fake runner lock")
            .commands
            .iter()
            .map(|(program, args)| render_command(program, args))
            .collect()
    }

    /// Docker invocations whose first argument is `subcommand`.
    pub fn docker_calls(&self, subcommand: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .expect("fake runner lock")
            .commands
            .iter()
            .filter(|(program, args)| {
                program == "docker" && args.first().map(String::as_str) == Some(subcommand)
            })
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn running(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .expect("fake runner lock")
            .running
            .keys()
            .cloned()
            .collect()
    }

    /// Host ports currently published by running containers, duplicates included.
    pub fn published_ports(&self) -> Vec<u16> {
        self.state
            .lock()
            .expect("fake runner lock")
            .running
            .values()
            .flatten()
            .copied()
            .collect()
    }

    pub fn start_container(&self, name: &str) {
        self.state
            .lock()
            .expect("fake runner lock")
            .running
            .insert(name.to_string(), Vec::new());
    }

    pub fn fail_builds(&self, fail: bool) {
        self.state.lock().expect("fake runner lock").fail_builds = fail;
    }

    /// Makes every invocation of `program` exit non-zero.
    pub fn fail_program(&self, program: &str) {
        self.state
            .lock()
            .expect("fake runner lock")
            .failing
            .insert(program.to_string());
    }

    fn docker(state: &mut FakeState, args: &[String]) -> Result<CommandOutput, ShellError> {
        let output = |stdout: &str| -> Result<CommandOutput, ShellError> {
            Ok(CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
            })
        };

        match args.first().map(String::as_str) {
            Some("ps") => {
                let names = state.running.keys().cloned().collect::<Vec<_>>();
                output(&names.join("\n"))
            }
            Some("build") if state.fail_builds => {
                Err(failed("docker", args, "npm ERR! build script failed"))
            }
            Some("build") => output("sha256:0123456789abcdef"),
            Some("run") if args.iter().any(|arg| arg == "-d") => {
                let Some(name) = flag_value(args, "--name").first().map(ToString::to_string)
                else {
                    return output("detached-anonymous");
                };
                if state.running.contains_key(&name) {
                    return Err(failed(
                        "docker",
                        args,
                        format!("Conflict. The container name \"/{name}\" is already in use"),
                    ));
                }

                let ports = flag_value(args, "-p")
                    .into_iter()
                    .filter_map(host_port)
                    .collect::<Vec<_>>();
                let taken = state.running.values().flatten().copied().collect::<HashSet<_>>();
                if let Some(port) = ports.iter().find(|port| taken.contains(*port)) {
                    return Err(failed(
                        "docker",
                        args,
                        format!("Bind for 127.0.0.1:{port} failed: port is already allocated"),
                    ));
                }

                state.running.insert(name.clone(), ports);
                output(&format!("{name}-container-id"))
            }
            Some("run") => output("hello from the foreground"),
            Some("stop") => {
                let name = args.last().cloned().unwrap_or_default();
                if state.running.remove(&name).is_some() {
                    output(&name)
                } else {
                    Err(failed(
                        "docker",
                        args,
                        format!("Error response from daemon: No such container: {name}"),
                    ))
                }
            }
            Some("rm") => {
                let name = args.last().cloned().unwrap_or_default();
                if state.running.contains_key(&name) {
                    Err(failed(
                        "docker",
                        args,
                        "You cannot remove a running container",
                    ))
                } else {
                    Err(failed(
                        "docker",
                        args,
                        format!("Error response from daemon: No such container: {name}"),
                    ))
                }
            }
            _ => output(""),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _cwd: Option<&Path>,
    ) -> Result<CommandOutput, ShellError> {
        let mut state = self.state.lock().expect("fake runner lock");
        state.commands.push((program.to_string(), args.to_vec()));

        if state.failing.contains(program) {
            return Err(failed(program, args, format!("{program} failed")));
        }

        if program == "docker" {
            return Self::docker(&mut state, args);
        }

        Ok(CommandOutput::default())
    }
}

/// Serves fixed manifests keyed by their manifest URL.
#[derive(Debug, Default)]
pub struct FakeSourceProvider {
    repositories: Mutex<HashSet<String>>,
    manifests: Mutex<HashMap<String, Manifest>>,
    fetches: Mutex<Vec<String>>,
}

impl FakeSourceProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_repository(&self, repository: &str) {
        self.repositories
            .lock()
            .expect("fake source lock")
            .insert(repository.to_string());
    }

    pub fn set_manifest(&self, repository: &str, branch: &str, manifest: Manifest) {
        self.manifests
            .lock()
            .expect("fake source lock")
            .insert(self.manifest_url(repository, branch), manifest);
    }

    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().expect("fake source lock").clone()
    }
}

#[async_trait]
impl SourceProvider for FakeSourceProvider {
    async fn exists(&self, repository: &str) -> EngineResult<bool> {
        Ok(self
            .repositories
            .lock()
            .expect("fake source lock")
            .contains(repository))
    }

    fn service_from_webhook(&self, payload: &[u8]) -> EngineResult<WebhookService> {
        let value = serde_json::from_slice::<serde_json::Value>(payload)
            .map_err(|error| EngineError::ConfigurationError(error.to_string()))?;
        let repository = value["repository"]["full_name"].as_str().unwrap_or_default();
        let branch = value["ref"]
            .as_str()
            .unwrap_or_default()
            .trim_start_matches("refs/heads/");
        if value["repository"]["private"].as_bool() == Some(true) {
            return Err(EngineError::ConfigurationError(
                "private repositories are not allowed".to_string(),
            ));
        }

        let service = Service::new(repository, branch)?;
        Ok(WebhookService {
            configuration_url: self.manifest_url(&service.repository, &service.branch),
            clone_url: self.clone_url(&service.repository),
            service,
        })
    }

    async fn fetch_manifest(&self, url: &str) -> EngineResult<Manifest> {
        self.fetches
            .lock()
            .expect("fake source lock")
            .push(url.to_string());
        Ok(self
            .manifests
            .lock()
            .expect("fake source lock")
            .get(url)
            .cloned()
            .unwrap_or_default())
    }

    fn clone_url(&self, repository: &str) -> String {
        format!("https://git.test/{repository}.git")
    }

    fn manifest_url(&self, repository: &str, branch: &str) -> String {
        format!("https://raw.test/{repository}/{branch}/service.json")
    }
}

/// Config rooted in `root` with `node` and `static` image recipes.
pub fn test_config(root: &Path) -> DockyardConfig {
    for image_type in ["node", "static"] {
        std::fs::create_dir_all(root.join("images").join(image_type)).expect("image recipe dir");
    }

    let path = |name: &str| Some(root.join(name).to_string_lossy().into_owned());
    DockyardConfig {
        data_dir: path("data"),
        base_domain: Some("dockyard.test".to_string()),
        admin_key_path: path(".key"),
        images: ImagesConfig {
            dir: path("images"),
            default_type: Some("node".to_string()),
            max_memory: Some("32m".to_string()),
            ..ImagesConfig::default()
        },
        nginx: NginxConfig {
            sites_dir: path("nginx-sites"),
            ..NginxConfig::default()
        },
        ..DockyardConfig::default()
    }
}
