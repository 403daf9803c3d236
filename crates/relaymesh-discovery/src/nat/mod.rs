//! NAT Traversal Module
//!
//! Everything a node needs to learn how the rest of the network sees it.
//!
//! # Components
//!
//! - **STUN**: binding request/response codec (RFC 5389) and a UDP socket
//!   serving both the client and the server role
//! - **Interfaces**: enumeration and filtering of local interface addresses
//! - **External address**: asks several STUN servers and only accepts an
//!   address all of them agree on
//!
//! # Example
//!
//! ```rust,no_run
//! use relaymesh_discovery::nat::{ExternalAddressConfig, StunSocket, determine_external_address};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (socket, _receiver) = StunSocket::bind("0.0.0.0:0".parse()?).await?;
//! let servers = vec!["203.0.113.10:9091".parse()?, "203.0.113.11:9091".parse()?];
//! match determine_external_address(&socket, &servers, &ExternalAddressConfig::default()).await {
//!     Some(addr) => println!("reachable at {}", addr),
//!     None => println!("no public address"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod external;
pub mod interfaces;
pub mod stun;

pub use external::{
    ExternalAddressConfig, agreed_address, determine_external_address, is_usable_result,
};
pub use interfaces::{InterfaceOptions, NetworkInterface, get_addrs, list_interfaces};
pub use stun::{StunAttribute, StunError, StunMessage, StunMessageClass, StunSocket};
