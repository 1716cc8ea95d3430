//! Generic UPnP callback server for receiving event notifications.
//!
//! This crate provides a lightweight HTTP server for handling UPnP NOTIFY requests.
//! It is designed to be generic and has no knowledge of device-specific protocols.
//!
//! # Overview
//!
//! - [`CallbackServer`]: HTTP server that binds to a local port and receives
//!   incoming UPnP event notifications.
//! - [`EventRouter`]: Routes incoming events based on subscription IDs to a
//!   channel. Unknown subscription IDs are refused with 412.
//! - [`NotificationPayload`]: Subscription ID, sequence number and raw XML
//!   body of one notification.
//!
//! Device-specific logic (device ids, service types, event parsing) lives in
//! the consuming crate, which maps subscription IDs back to its own keys.
//!
//! # Example
//!
//! ```no_run
//! use callback_server::{CallbackConfig, CallbackServer, NotificationPayload};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), callback_server::ServerError> {
//!     let (tx, mut rx) = mpsc::unbounded_channel::<NotificationPayload>();
//!     let server = CallbackServer::new(CallbackConfig::default(), tx).await?;
//!
//!     server.router().register("uuid:RINCON_AAA_sub0000000001".to_string()).await;
//!
//!     while let Some(notification) = rx.recv().await {
//!         println!("SEQ {} for {}", notification.seq, notification.subscription_id);
//!     }
//!     Ok(())
//! }
//! ```

mod error;
pub mod router;
mod server;

pub use error::ServerError;
pub use router::{EventRouter, NotificationPayload};
pub use server::{CallbackConfig, CallbackServer};
