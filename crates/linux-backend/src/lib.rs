mod bomberman;
mod command;
mod config;
mod layercake;
mod network;
mod paths;
mod process_tracker;
mod repository;
mod resources;

pub use bomberman::{Bomberman, Detonator};
pub use command::{CommandError, CommandRunner, CommandSpec, LocalRunner, Privilege, RunningCommand, exec};
pub use config::{
    BackendConfig, ConfigError, ConfigResult, GraphConfig, NetworkConfig, ProcessConfig, generate, load,
};
pub use layercake::{Cake, Layer, LayerError, LayerId, LayerResult, OvenCleaner, Retainer};
pub use network::{
    BRIDGE_NAME_LEN, BridgeError, BridgeManager, BridgeResult, Destroyer, IpLinkDestroyer, Ipv4Subnet,
    SUBNET_PREFIX, SubnetError, SubnetParseError, SubnetPool, SubnetResult,
};
pub use paths::ContainerPaths;
pub use process_tracker::{
    FanIn, FanInError, FanOut, InputSink, LinkSignaller, NamespacedSignaller, Phase, Process, ProcessError,
    ProcessResult, ProcessTracker, SignalRequest, Signaller,
};
pub use repository::ContainerRepository;
pub use resources::{ContainerResources, ResourceError, ResourcePool, ResourceRequest, ResourceResult};
