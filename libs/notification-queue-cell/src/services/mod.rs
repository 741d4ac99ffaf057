pub mod calendar;
pub mod channels;
pub mod consumer;
pub mod dedup;
pub mod memory_store;
pub mod producer;
pub mod queue;
pub mod store;
pub mod templates;
pub mod worker;

pub use calendar::*;
pub use channels::*;
pub use consumer::*;
pub use dedup::*;
pub use memory_store::*;
pub use producer::*;
pub use queue::*;
pub use store::*;
pub use templates::*;
pub use worker::*;
