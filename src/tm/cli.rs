use std::path::PathBuf;

use clap::Parser;

use crate::tm::rpc::DEFAULT_SOCKET;

#[derive(Debug, Parser)]
#[command(name = "taskmasterd", version, about = "taskmaster supervision daemon")]
pub struct DaemonArgs {
    /// Config YAML path. When absent, ./config.yaml is tried first,
    /// then $XDG_CONFIG_HOME/taskmaster/config.yaml.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Detach from the terminal by re-execing; pass --daemon=false to
    /// stay in the foreground.
    #[arg(long = "daemon", default_value_t = true, action = clap::ArgAction::Set)]
    pub daemon: bool,
}

#[derive(Debug, Parser)]
#[command(name = "taskmasterctl", version, about = "taskmaster interactive control client")]
pub struct CtlArgs {
    /// Unix socket path of the running daemon.
    #[arg(short = 's', long = "socket", default_value = DEFAULT_SOCKET)]
    pub socket: PathBuf,
}

#[derive(Debug, Parser)]
#[command(name = "taskmaster", version, about = "taskmaster supervisor with an interactive shell")]
pub struct ShellArgs {
    /// Config YAML path. When absent, ./config.yaml is tried first,
    /// then $XDG_CONFIG_HOME/taskmaster/config.yaml.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
}
