mod bridge;
mod error;
mod pool;
mod subnet;

pub use bridge::{BRIDGE_NAME_LEN, BridgeManager, Destroyer, IpLinkDestroyer};
pub use error::{BridgeError, BridgeResult, SubnetError, SubnetParseError, SubnetResult};
pub use pool::{SUBNET_PREFIX, SubnetPool};
pub use subnet::Ipv4Subnet;
