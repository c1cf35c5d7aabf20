//! Handler interface between the Portcullis SSH server and its backends.
//!
//! The SSH server framework owns the wire protocol: it accepts TCP
//! connections, runs the SSH handshake, and decodes channel requests. Every
//! decoded event is forwarded to a backend through the traits in this crate.
//! A backend implements [`NetworkConnectionHandler`] for the lifetime of one
//! network connection, hands out an [`SshConnectionHandler`] once the
//! handshake succeeds, and a [`SessionChannelHandler`] per session channel.
//!
//! Backends never see raw SSH packets; they receive plain byte streams for
//! stdio and report process termination through a one-shot exit sink.

mod handler;

pub use handler::{
    AuthResponse, ChannelId, ExitSender, ExitStatus, HandlerError, NetworkConnectionHandler,
    SessionChannelHandler, SessionStreams, SshConnectionHandler,
};
