#![warn(clippy::pedantic)]
#![doc = include_str!("../README.md")]

mod registry;

mod observer;
pub use observer::Observer;

mod host;
pub use host::{Host, HostState};

mod raw;

mod broadcaster;
pub use broadcaster::{Broadcaster, WeakBroadcaster};

mod mediator;
pub use mediator::Mediator;

mod producer;
pub use producer::{Emitter, Producer};

mod conversions;
pub use conversions::BroadcasterStream;

mod error;
pub use error::SourceConflict;

pub use cambium::{self, Confined, Lane};
