use gitserver_core::server::DEFAULT_QUEUE_CAPACITY;
use gitserver_core::ServerConfig;

#[derive(clap::Parser, Debug)]
#[command(name = "gitserver")]
pub struct Args {
    #[arg(long, help = "Directory holding the managed repositories")]
    pub repos_dir: std::path::PathBuf,
    #[arg(long, default_value = "3178")]
    pub port: u16,
    #[arg(
        long,
        default_value_t = DEFAULT_QUEUE_CAPACITY,
        help = "Requests waiting for dispatch before callers block"
    )]
    pub queue_capacity: usize,
    #[arg(long, default_value = "git")]
    pub git_binary: std::path::PathBuf,
    #[arg(
        long,
        help = "Do not verify SSH host keys of remotes. Only for testing!"
    )]
    pub insecure_skip_check_verify_ssh: bool,
    #[arg(long, help = "Log a structured event for every executed command")]
    pub exec_events: bool,
    #[arg(
        long = "track-repo",
        help = "Regex of repository names that get their own metric label"
    )]
    pub track_repo: Vec<String>,
}

impl Args {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            repos_dir: self.repos_dir.clone(),
            insecure_skip_check_verify_ssh: self.insecure_skip_check_verify_ssh,
            queue_capacity: self.queue_capacity,
            git_binary: self.git_binary.clone(),
        }
    }
}
