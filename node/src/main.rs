use std::io;

use log::info;
use tokio::signal;

use node::{NodeConfig, NodeServer};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config = NodeConfig::from_env()?;
    let server = NodeServer::bind(config.addr()).await?;

    tokio::select! {
        ret = server.run() => {
            ret?;
            info!("shut down by the orchestrator");
        }
        _ = signal::ctrl_c() => {
            info!("received SIGTERM");
        }
    }

    Ok(())
}
