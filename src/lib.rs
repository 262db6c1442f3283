pub mod action;
pub mod backend;
pub mod call;
pub mod client;
pub mod config;
pub mod console;
pub mod device;
pub mod error;
pub mod event;
pub mod media;
pub mod signaling;
pub mod token;
pub mod version;

pub use client::{ClientSession, ClientSessionBuilder, PhoneHandle};
pub use error::{PhoneError, Result};
