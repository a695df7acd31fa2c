// Job lifecycle: records, their store, execution strategies and the queue worker

pub mod executor;
pub mod model;
pub mod queue;
pub mod service;
pub mod state;
pub mod store;
pub mod worker;
