use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Subnet {0} already exists")]
    SubnetExists(String),

    #[error("Subnet {0} overlaps with an existing subnet")]
    SubnetOverlap(String),

    #[error("Invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Failed to render option {0}: {1}")]
    OptionRender(u8, String),

    #[error("Address {0} is outside the subnet")]
    AddressOutOfRange(Ipv4Addr),
}

impl Error {
    /// HTTP-convention status code for the management layer.
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::SubnetExists(_) => 409,
            Self::SubnetOverlap(_) | Self::InvalidSubnet(_) | Self::InvalidPacket(_) => 400,
            Self::AddressOutOfRange(_) | Self::OptionRender(..) | Self::InvalidConfig(_) => 400,
            Self::Io(_) | Self::Json(_) | Self::Socket(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
