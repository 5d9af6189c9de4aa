//! Document-store targets.

mod mongo;

pub use mongo::MongoTarget;
