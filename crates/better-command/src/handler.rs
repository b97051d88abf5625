//! Collection of handlers, which transform program stdout lines into tracing events.

use std::sync::{Arc, Mutex};

use tracing::info;

pub trait Handler: Send {
	fn handle_line(&mut self, e: &str);
}

/// Handler wrapper, which can be cloned.
pub struct ClonableHandler<H>(Arc<Mutex<H>>);
impl<H> Clone for ClonableHandler<H> {
	fn clone(&self) -> Self {
		Self(self.0.clone())
	}
}
impl<H> ClonableHandler<H> {
	pub fn new(inner: H) -> Self {
		Self(Arc::new(Mutex::new(inner)))
	}
}
impl<H: Handler> Handler for ClonableHandler<H> {
	fn handle_line(&mut self, e: &str) {
		self.0.lock().unwrap().handle_line(e)
	}
}

/// Converts command output to tracing lines.
pub struct PlainHandler;
impl Handler for PlainHandler {
	fn handle_line(&mut self, e: &str) {
		info!(target: "log", "{e}");
	}
}

/// Ignores output.
pub struct NoopHandler;
impl Handler for NoopHandler {
	fn handle_line(&mut self, _e: &str) {}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Counter(usize);
	impl Handler for Counter {
		fn handle_line(&mut self, _e: &str) {
			self.0 += 1;
		}
	}

	#[test]
	fn clonable_handler_shares_state() {
		let h = ClonableHandler::new(Counter(0));
		let mut a = h.clone();
		let mut b = h.clone();
		a.handle_line("one");
		b.handle_line("two");
		assert_eq!(h.0.lock().unwrap().0, 2);
	}
}
