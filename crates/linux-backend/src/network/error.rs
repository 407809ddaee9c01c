use crate::command::CommandError;

use super::subnet::Ipv4Subnet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubnetParseError {
    #[error("invalid CIDR {0:?}: expected a.b.c.d/prefix")]
    Format(String),

    #[error("invalid CIDR {0:?}: bad address")]
    Address(String),

    #[error("invalid CIDR {0:?}: prefix must be 0..=32")]
    Prefix(String),
}

/// Subnet pool errors. The pool is unchanged when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubnetError {
    #[error("insufficient subnets remaining in the pool")]
    InsufficientSubnets,

    #[error("the requested subnet {0} has already been allocated")]
    AlreadyAllocated(Ipv4Subnet),

    #[error("cannot release subnet {0}: it is not allocated")]
    ReleasedUnallocated(Ipv4Subnet),
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("subnet {subnet} is already bound to bridge {bridge}")]
    SubnetBound { subnet: Ipv4Subnet, bridge: String },

    #[error("failed to destroy bridge {bridge}")]
    Destroy {
        bridge: String,
        #[source]
        source: CommandError,
    },
}

pub type SubnetResult<T> = std::result::Result<T, SubnetError>;
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
