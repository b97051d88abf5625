mod handler;

pub use handler::{ClonableHandler, Handler, NoopHandler, PlainHandler};
