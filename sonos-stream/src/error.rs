//! Error types for the sonos-stream crate.

use callback_server::ServerError;
use soap_client::SoapError;

use crate::types::ServiceRef;

/// Errors raised while starting the event broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// An error occurred in the callback server
    #[error("Callback server error: {0}")]
    CallbackServer(#[from] ServerError),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Errors from subscription operations.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The service is not (or no longer) tracked
    #[error("Subscription not found: {0}")]
    NotTracked(ServiceRef),

    /// The manager has been shut down
    #[error("Subscription manager is shut down")]
    Shutdown,

    /// A GENA request failed
    #[error("GENA request failed: {0}")]
    Gena(#[from] SoapError),
}

/// Errors raised while turning a NOTIFY into a [`ServiceEvent`].
///
/// [`ServiceEvent`]: crate::event::ServiceEvent
#[derive(Debug, thiserror::Error)]
pub enum EventProcessingError {
    /// The SID is not (or no longer) bound to a live subscription
    #[error("No subscription found for SID: {0}")]
    UnknownSubscription(String),

    /// The body is not a usable property set
    #[error("Failed to parse event body: {0}")]
    Parsing(#[source] SoapError),

    /// The event consumer has gone away
    #[error("Event channel closed")]
    ChannelClosed,
}

/// Convenience type alias for Results using SubscriptionError.
pub type Result<T> = std::result::Result<T, SubscriptionError>;
