//! Relay Core
//!
//! Ties the broker connection and the local listener together:
//! - [`TopicRouter`] resolves which endpoint a message maps to
//! - [`RelayHandler`] decides what to do with a routed message
//! - [`Bridge`] owns the lifecycle and the two units driving the transports
//!
//! # Example Configuration
//!
//! ```toml
//! [forward_topics]
//! "spartan/pings" = "/avatar/parameters/ping"
//! "public/example" = ""            # observe only
//!
//! [reverse_topics]
//! "/avatar/parameters/alertall" = "spartan/public/alert"
//! ```

mod handler;
mod relay;
mod topic_router;

#[cfg(test)]
mod tests;

pub use handler::{
    BrokerPublisher, DefaultHandler, Dispatcher, LocalSender, RelayContext, RelayHandler,
};
pub use relay::{Bridge, RelayState};
pub use topic_router::TopicRouter;
