use std::path::PathBuf;

use clap::Parser;

use taskforge_core::ResourceVector;
use taskforge_engine::EngineConfig;

fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(512)
}

fn parse_resources(input: &str) -> Result<ResourceVector, String> {
    let mut parts = input.split(',');
    let cpus = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("invalid resource vector {input:?}"))?
        .parse::<u64>()
        .map_err(|_| format!("invalid CPU count in {input:?}"))?;
    let gpus = match parts.next() {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("invalid GPU count in {input:?}"))?,
        None => 0,
    };
    if parts.next().is_some() {
        return Err(format!("expected `CPU,GPU`, got {input:?}"));
    }
    Ok(ResourceVector::new(cpus, gpus))
}

#[derive(Debug, Clone, Parser)]
#[command(name = "taskforged", version, about = "Per-node task scheduler daemon")]
pub struct Cli {
    /// IP address advertised to the cluster.
    #[arg(long, env = "TASKFORGE_NODE_IP", default_value = "127.0.0.1")]
    pub node_ip_address: String,

    /// Path of the object store notification socket.
    #[arg(long, env = "TASKFORGE_OBJECT_STORE")]
    pub object_store_name: Option<PathBuf>,

    /// Path of the object store manager socket (remote fetches).
    #[arg(long, env = "TASKFORGE_OBJECT_STORE_MANAGER")]
    pub object_store_manager_name: Option<PathBuf>,

    /// Path at which the scheduler binds its worker socket.
    #[arg(
        long,
        env = "TASKFORGE_SOCKET",
        default_value = "/tmp/taskforge/scheduler.sock"
    )]
    pub local_scheduler_name: PathBuf,

    /// `host:port` of the metadata store. Omit to run standalone with an
    /// in-process store.
    #[arg(long, env = "TASKFORGE_REDIS")]
    pub redis_address: Option<String>,

    /// Number of workers to spawn and maintain.
    #[arg(long, env = "TASKFORGE_NUM_WORKERS", default_value_t = default_num_workers())]
    pub num_workers: usize,

    /// Schedulable capacity as `CPU,GPU` (defaults to all cores, no GPUs).
    #[arg(long, env = "TASKFORGE_RESOURCES", value_parser = parse_resources)]
    pub static_resources: Option<ResourceVector>,

    /// Worker command template; every `{socket}` expands to the worker
    /// socket path.
    #[arg(long, env = "TASKFORGE_WORKER_COMMAND")]
    pub worker_command: Option<String>,
}

impl Cli {
    pub fn engine_config(&self) -> EngineConfig {
        let default_cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(1);

        EngineConfig {
            node_address: self.node_ip_address.clone(),
            worker_socket: self.local_scheduler_name.clone(),
            object_store_socket: self.object_store_name.clone(),
            object_store_manager_socket: self.object_store_manager_name.clone(),
            redis_address: self.redis_address.clone(),
            num_workers: self.num_workers,
            static_resources: self
                .static_resources
                .unwrap_or(ResourceVector::new(default_cpus, 0)),
            worker_command: self
                .worker_command
                .as_deref()
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            graceful_kill_timeout: EngineConfig::DEFAULT_GRACEFUL_KILL_TIMEOUT,
            tick_interval: EngineConfig::DEFAULT_TICK_INTERVAL,
            standalone_object_tracking: self.object_store_name.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_vectors_parse_cpu_and_gpu() {
        assert_eq!(parse_resources("8,2"), Ok(ResourceVector::new(8, 2)));
        assert_eq!(parse_resources("4"), Ok(ResourceVector::new(4, 0)));
        assert!(parse_resources("").is_err());
        assert!(parse_resources("a,b").is_err());
        assert!(parse_resources("1,2,3").is_err());
    }

    #[test]
    fn worker_command_template_is_tokenized() {
        let cli = Cli::parse_from([
            "taskforged",
            "--num-workers",
            "2",
            "--worker-command",
            "python worker.py --socket {socket}",
        ]);
        let config = cli.engine_config();
        assert_eq!(
            config.worker_command,
            vec!["python", "worker.py", "--socket", "{socket}"]
        );
        assert!(config.standalone_object_tracking);
    }
}
