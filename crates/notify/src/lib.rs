pub mod bus;
pub mod error;
pub mod events;
pub mod transport;
pub mod webhook;

pub use bus::{AggregateState, DeliveryOutcome, EventFilter, NotificationBus, Subscription};
pub use error::NotifyError;
pub use events::Event;
pub use transport::{ChannelTransport, Transport};
pub use webhook::WebhookTransport;
