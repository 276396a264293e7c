pub mod bitset;
pub mod config;
pub mod error;
pub mod options;
pub mod packet;
pub mod server;
pub mod subnet;
pub mod tracker;

pub use config::Config;
pub use error::{Error, Result};
pub use options::{MessageType, OptionCode, OptionTemplate};
pub use packet::{DhcpPacket, RawOption};
pub use server::DhcpServer;
pub use subnet::{ApiSubnet, Binding, Lease, Subnet};
pub use tracker::DataTracker;
