// In-process activity routing: producer/consumer registry, resource
// queuing and the network boundary.

pub mod dispatcher;
pub mod network;
pub mod queuer;

pub use dispatcher::{
    ActivityConsumer, ActivityDispatcher, ActivityListener, ActivityProducer,
    BasicActivityProducer, ConsumerPriority,
};
pub use network::{ActivitySink, NetworkActivityBridge};
pub use queuer::ActivityQueuer;
