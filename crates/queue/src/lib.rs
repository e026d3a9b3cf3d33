pub mod assembler;
pub mod error;
pub mod item;
pub mod store;

pub use assembler::BatchAssembler;
pub use error::QueueError;
pub use item::{
    AggregateCounts, Batch, BatchStatus, CancelScope, CancellationRecord, ItemStatus, NewItem,
    QueueItem,
};
pub use store::{QueueStore, TransitionUpdate};
