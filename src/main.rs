mod tcp2ws;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "tcp2ws",
    version,
    about = "tcp2ws - tunnel TCP connections over WebSocket, surviving tunnel drops"
)]
struct Cli {
    /// Path to tcp2ws config file (.toml/.yaml/.yml). If omitted, uses TCP2WS_CONFIG; then auto-detects tcp2ws.toml > tcp2ws.yaml > tcp2ws.yml from CWD and the user config dir; then runs on built-in defaults.
    #[arg(long, env = "TCP2WS_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// ws[s]:// or http[s]:// URL of the terminator (client mode), or the backend address/port (server mode).
    target: String,

    /// Local address/port to listen on: TCP in client mode, HTTP/WebSocket in server mode.
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tcp2ws::run(cli.config, cli.target, cli.listen).await
}
