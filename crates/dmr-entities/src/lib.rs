//! Runtime entities of the BrewHub DMR network server: storage backends,
//! the repeater session registry, the Homebrew UDP server, the packet
//! router, the call tracker, the parrot loopback and the IPSC ingress.

pub mod calls;
pub mod hbrp_server;
pub mod instance;
pub mod ipsc;
pub mod parrot;
pub mod repeater;
pub mod router;
pub mod store;
