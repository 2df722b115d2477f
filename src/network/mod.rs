pub mod cloud;
pub mod topology;

pub use cloud::{CloudInfo, CloudMetadata, Location, StaticCloudMetadata};
pub use topology::{
    build_launch_args, cluster_name, normalize_peer, resolve_peers, DeploymentMode,
    LaunchSettings, PeerSource, DEV_HTTP_PORT, INTER_NODE_PORT, SQL_PORT,
};
