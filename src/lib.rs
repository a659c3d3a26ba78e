pub mod error;
pub mod messages;
pub mod networking;
pub mod cryptography;
pub mod registry;
pub mod config;
pub mod server;
pub mod client;
pub mod commands;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const RSA_KEY_BITS: usize = 2048;
pub const CHUNK_SIZE: usize = 1024;
pub const MAX_FRAME_LEN: usize = 64 * 1024;
pub const MAX_IDENTITY_LEN: usize = 32;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8888;
