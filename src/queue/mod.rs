pub mod manager;

pub use manager::{QueueEntry, QueueManager, WishDispatcher};
