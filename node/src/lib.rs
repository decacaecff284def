pub mod builder;
pub mod config;
pub mod remote;
pub mod server;

pub use builder::StageBuilder;
pub use config::NodeConfig;
pub use remote::{PeerResolver, Peers, RemoteStage, block_on};
pub use server::NodeServer;
