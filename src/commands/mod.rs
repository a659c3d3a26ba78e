//! # Commands Module
//!
//! The two command handlers for murmur:
//!
//! ## `serve`
//! Runs the relay server:
//! - Binds the listening socket
//! - Registers clients under unique identities
//! - Hands each client the room key wrapped under its RSA public key
//! - Relays chat messages and keeps every client's roster current
//!
//! ## `chat`
//! Runs the terminal client:
//! - Generates an RSA keypair and performs the handshake
//! - Encrypts outgoing lines once the room key arrives
//! - Prints incoming messages, rosters and notices

pub mod serve;
pub mod chat;
