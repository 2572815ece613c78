//! # netconf2
//!
//! A Rust library for the NETCONF protocol ([RFC 6241](https://datatracker.ietf.org/doc/html/rfc6241),
//! [RFC 6242](https://datatracker.ietf.org/doc/html/rfc6242)) providing both
//! the client and the server role.
//!
//! NETCONF is a network management protocol defined by the IETF. Peers
//! exchange XML messages (rpc, rpc-reply and notification documents)
//! over a secure transport, after negotiating capabilities with an
//! initial `<hello>` exchange.
//!
//! ## Features
//!
//! - **Both framings**: end-of-message framing (NETCONF 1.0) and chunked
//!   framing (NETCONF 1.1), negotiated automatically during hello
//! - **Three transports**: raw file descriptors, SSH (`netconf`
//!   subsystem, via russh) and TLS (via rustls with cert-to-name user
//!   mapping)
//! - **Server poll engine**: many sessions multiplexed across worker
//!   threads with per-session dispatch exclusion
//! - **Call home**: RFC 8071 reversed connection establishment for both
//!   roles
//!
//! ## Quick start, client side
//!
//! ```ignore
//! use netconf2::client;
//! use netconf2::config::ClientConfig;
//! use netconf2::rpc::{Datastore, Rpc};
//!
//! # fn main() -> netconf2::Result<()> {
//! let mut config = ClientConfig::default();
//! config.ssh.username = "admin".into();
//! config.ssh.password = Some("password".into());
//!
//! let session = client::connect_ssh(&config, "192.0.2.1", 830)?;
//! let reply = session.call(
//!     &Rpc::GetConfig { source: Datastore::Running, filter: None },
//!     10_000,
//! )?;
//! println!("{}", reply.to_xml());
//! session.close();
//! # Ok(())
//! # }
//! ```
//!
//! ## Quick start, server side
//!
//! ```ignore
//! use netconf2::config::ServerConfig;
//! use netconf2::rpc::{Reply, RpcError};
//! use netconf2::server::Server;
//! use netconf2::transport::TransportKind;
//!
//! # fn main() -> netconf2::Result<()> {
//! let server = Server::new(ServerConfig::default());
//! server.update_ssh_options(|ssh| ssh.hostkeys.push("/etc/netconf/hostkey".into()));
//! server.add_endpoint("main", TransportKind::Ssh, "0.0.0.0", 830)?;
//!
//! let ps = server.new_poll_set();
//! if let Some(session) = server.accept(5_000)? {
//!     ps.add(session)?;
//! }
//! ps.poll(500, &|_session, rpc| {
//!     Err(RpcError::new("application", "operation-not-supported", None))
//! });
//! # Ok(())
//! # }
//! ```
//!
//! The library stops at the session layer: rpc contents are handed to the
//! embedding application as element trees, and schema validation or
//! datastore semantics are the embedder's business.

pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod message;
pub mod rpc;
pub mod server;
pub mod session;
pub mod transport;
pub mod xml;

pub use error::{Error, Result};
pub use framing::Version;
pub use message::MsgType;
pub use session::{Role, SchemaContext, Session, SessionStatus, TermReason};
