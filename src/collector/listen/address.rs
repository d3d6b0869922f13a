//! Listen address parsing (`<transport>,<address>`).

use std::fmt;
use std::str::FromStr;

use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

const FORMAT_HINT: &str = "the correct format is: <tcp|tcp4|tcp6|unix|unixpacket>,<address>";

/// Errors produced while parsing a listen address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("listen address {0:?} is not in the correct format; {hint}", hint = FORMAT_HINT)]
    Format(String),

    #[error("unknown listen transport {0:?}; {hint}", hint = FORMAT_HINT)]
    Transport(String),
}

/// Socket transport for the ingestion listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Transport {
    /// TCP on whatever family the address resolves to.
    Tcp,
    /// TCP restricted to IPv4.
    Tcp4,
    /// TCP restricted to IPv6.
    Tcp6,
    /// Unix domain stream socket.
    Unix,
    /// Unix domain sequenced-packet socket.
    Unixpacket,
}

impl Transport {
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix | Self::Unixpacket)
    }
}

/// Parsed `<transport>,<address>` pair.
///
/// ```
/// use vigil::collector::listen::{ListenAddress, Transport};
///
/// let addr: ListenAddress = "tcp4,127.0.0.1:7341".parse().unwrap();
/// assert_eq!(addr.transport, Transport::Tcp4);
/// assert_eq!(addr.address, "127.0.0.1:7341");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddress {
    pub transport: Transport,
    pub address: String,
}

impl FromStr for ListenAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').collect();
        let [transport, address] = parts.as_slice() else {
            return Err(AddressError::Format(s.to_string()));
        };
        if address.is_empty() {
            return Err(AddressError::Format(s.to_string()));
        }

        let transport = Transport::from_str(transport)
            .map_err(|_| AddressError::Transport((*transport).to_string()))?;

        Ok(Self {
            transport,
            address: (*address).to_string(),
        })
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.transport, self.address)
    }
}
