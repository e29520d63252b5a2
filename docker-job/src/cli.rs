//! Command line parsing and conversion into validated run settings.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::docker::{DEFAULT_API_VERSION, Endpoint};
use crate::error::ConfigError;
use crate::lifecycle::{LifecycleOptions, ServiceRequest};
use crate::repeat::RepeatPredicate;
use crate::run::RunConfig;
use crate::spec::{ConfigSpec, VolumeSpec};

pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
pub const DEFAULT_REMOTE_SOCKET: &str = "/var/run/docker.sock";

/// Run a container to completion as a Docker Swarm service
#[derive(Parser, Debug)]
#[command(name = "dj", version, about)]
pub struct Args {
    /// Create and start the service, then exit without waiting
    #[arg(short, long, conflicts_with_all = ["showlogs", "follow", "rm"])]
    pub detach: bool,

    /// Service name (must not exist yet)
    #[arg(long)]
    pub name: Option<String>,

    /// Number of tasks to run
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    pub replicas: u64,

    /// Print each task's logs once it completes
    #[arg(long)]
    pub showlogs: bool,

    /// Stream task output while waiting
    #[arg(short, long)]
    pub follow: bool,

    /// Run again until the logs match this pattern
    #[arg(long, value_name = "REGEX")]
    pub repeat_until: Option<String>,

    /// Run again as long as the logs match this pattern
    #[arg(long, value_name = "REGEX")]
    pub repeat_while: Option<String>,

    /// Remove the service when done
    #[arg(long)]
    pub rm: bool,

    /// Pull the image before each run
    #[arg(long)]
    pub pull: bool,

    /// Environment variable for the container
    #[arg(short, long, value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Bind mount, source:target[:ro|rw]
    #[arg(short = 'v', long, value_name = "SRC:DST")]
    pub volume: Vec<String>,

    /// Attach a swarm config, e.g. source=app,target=/etc/app.toml,mode=0400
    #[arg(long, value_name = "SPEC")]
    pub config: Vec<String>,

    /// Docker daemon address
    #[arg(short = 'H', long, env = "DOCKER_HOST", default_value = DEFAULT_DOCKER_HOST)]
    pub host: String,

    /// Docker Engine API version
    #[arg(long, default_value = DEFAULT_API_VERSION)]
    pub api_version: String,

    /// Reach the daemon through ssh, [user@]host
    #[arg(long)]
    pub ssh_hostname: Option<String>,

    /// Identity file for ssh
    #[arg(long)]
    pub ssh_identity_file: Option<PathBuf>,

    /// Docker socket path on the ssh host
    #[arg(long, default_value = DEFAULT_REMOTE_SOCKET)]
    pub ssh_remote: String,

    /// Delay between state checks
    #[arg(long, default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Give up waiting for tasks after this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Stop repeating after this many runs
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_iterations: Option<u64>,

    /// Image to run
    pub image: String,

    /// Arguments for the container
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Where and how to reach the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// `None` when the daemon is reached through an ssh tunnel.
    pub endpoint: Option<Endpoint>,
    pub api_version: String,
    pub ssh: Option<SshTarget>,
}

/// Remote host whose docker socket is forwarded over ssh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: Option<String>,
    pub host: String,
    pub identity_file: Option<PathBuf>,
    pub remote_socket: String,
}

impl SshTarget {
    pub fn parse(
        hostname: &str,
        identity_file: Option<PathBuf>,
        remote_socket: String,
    ) -> Result<Self, ConfigError> {
        let (user, host) = match hostname.split_once('@') {
            Some((user, host)) => (Some(user.to_string()), host),
            None => (None, hostname),
        };
        if host.is_empty() || user.as_deref() == Some("") {
            return Err(ConfigError::InvalidHost(hostname.to_string()));
        }
        Ok(Self {
            user,
            host: host.to_string(),
            identity_file,
            remote_socket,
        })
    }

    /// `user@host` as passed to ssh.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

impl Args {
    /// Validate everything that can be checked without the daemon.
    pub fn into_config(self) -> Result<(RunConfig, ConnectionConfig), ConfigError> {
        let repeat =
            RepeatPredicate::from_patterns(self.repeat_until.as_deref(), self.repeat_while.as_deref())?;
        let volumes = self
            .volume
            .iter()
            .map(|v| v.parse::<VolumeSpec>())
            .collect::<Result<Vec<_>, _>>()?;
        let configs = self
            .config
            .iter()
            .map(|c| c.parse::<ConfigSpec>())
            .collect::<Result<Vec<_>, _>>()?;

        let ssh = self
            .ssh_hostname
            .as_deref()
            .map(|h| SshTarget::parse(h, self.ssh_identity_file.clone(), self.ssh_remote.clone()))
            .transpose()?;
        let connection = ConnectionConfig {
            endpoint: match &ssh {
                Some(_) => None,
                None => Some(Endpoint::parse(&self.host)?),
            },
            api_version: self.api_version,
            ssh,
        };

        let interval = Duration::from_millis(self.poll_interval_ms);
        let run = RunConfig {
            service: ServiceRequest {
                image: self.image,
                args: self.args,
                name: self.name,
                env: self.env,
                volumes,
                configs,
            },
            replicas: self.replicas,
            detach: self.detach,
            show_logs: self.showlogs,
            follow: self.follow,
            remove: self.rm,
            pull: self.pull,
            repeat,
            max_iterations: self.max_iterations,
            lifecycle: LifecycleOptions {
                poll_interval: interval,
                discovery_interval: interval,
                timeout: self.timeout_secs.map(Duration::from_secs),
            },
        };

        Ok((run, connection))
    }
}
