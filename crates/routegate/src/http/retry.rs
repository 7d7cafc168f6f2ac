use std::sync::atomic::{AtomicBool, Ordering};

use crate::http::{Body, Method};
use crate::*;

/// Methods whose retries are always safe. Everything else may only be
/// retried while the request body is provably untouched.
pub fn is_idempotent(method: &Method) -> bool {
	matches!(
		*method,
		Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
	)
}

/// The request body, shared across dispatch attempts without buffering.
///
/// The body stays parked here until an attempt actually needs it: each
/// [`AttemptBody`] claims the inner stream lazily on first poll. An attempt
/// that fails before pulling any frame (a refused dial, a TLS failure, a
/// reset before the body was read) hands the stream back untouched, so the
/// next attempt can send it. Once a single frame has been yielded the body is
/// spent and no further attempt may transmit.
pub struct SharedBody {
	slot: Arc<Mutex<Option<Body>>>,
	touched: Arc<AtomicBool>,
	empty: bool,
	hint: (u64, Option<u64>),
}

impl SharedBody {
	pub fn new(body: Body) -> SharedBody {
		let empty = http_body::Body::is_end_stream(&body);
		let hint = {
			let h = http_body::Body::size_hint(&body);
			(h.lower(), h.upper())
		};
		SharedBody {
			slot: Arc::new(Mutex::new(Some(body))),
			touched: Arc::new(AtomicBool::new(false)),
			empty,
			hint,
		}
	}

	/// Whether any frame has been handed to an upstream.
	pub fn touched(&self) -> bool {
		self.touched.load(Ordering::SeqCst)
	}

	/// Whether another attempt could still transmit the full body.
	pub fn replayable(&self) -> bool {
		self.empty || self.slot.lock().expect("lock poisoned").is_some()
	}

	pub fn attempt(&self) -> AttemptBody {
		AttemptBody {
			slot: self.slot.clone(),
			touched: self.touched.clone(),
			empty: self.empty,
			hint: self.hint,
			taken: None,
		}
	}
}

/// One attempt's view of the shared request body.
pub struct AttemptBody {
	slot: Arc<Mutex<Option<Body>>>,
	touched: Arc<AtomicBool>,
	empty: bool,
	hint: (u64, Option<u64>),
	taken: Option<Body>,
}

impl http_body::Body for AttemptBody {
	type Data = Bytes;
	type Error = crate::http::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Bytes>, Self::Error>>> {
		let this = self.get_mut();
		if this.empty {
			return Poll::Ready(None);
		}
		if this.taken.is_none() {
			let body = this.slot.lock().expect("lock poisoned").take();
			match body {
				Some(b) => this.taken = Some(b),
				// A prior attempt consumed the stream; the caller should have
				// refused to retry.
				None => {
					return Poll::Ready(Some(Err("request body already consumed".into())));
				},
			}
		}
		let inner = this.taken.as_mut().expect("taken above");
		let res = ready!(Pin::new(inner).poll_frame(cx));
		if res.is_some() {
			this.touched.store(true, Ordering::SeqCst);
		}
		Poll::Ready(res)
	}

	fn is_end_stream(&self) -> bool {
		if self.empty {
			return true;
		}
		match &self.taken {
			Some(b) => http_body::Body::is_end_stream(b),
			None => false,
		}
	}

	fn size_hint(&self) -> http_body::SizeHint {
		match &self.taken {
			Some(b) => http_body::Body::size_hint(b),
			None => {
				let mut h = http_body::SizeHint::new();
				h.set_lower(self.hint.0);
				if let Some(upper) = self.hint.1 {
					h.set_upper(upper);
				}
				h
			},
		}
	}
}

impl Drop for AttemptBody {
	fn drop(&mut self) {
		// The attempt claimed the stream but never transmitted a frame; park
		// it again for the next attempt.
		if let Some(body) = self.taken.take() {
			if !self.touched.load(Ordering::SeqCst) {
				*self.slot.lock().expect("lock poisoned") = Some(body);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use http_body_util::BodyExt;

	use super::*;

	#[test]
	fn idempotent_methods() {
		for m in [
			Method::GET,
			Method::HEAD,
			Method::OPTIONS,
			Method::PUT,
			Method::DELETE,
		] {
			assert!(is_idempotent(&m), "{m}");
		}
		assert!(!is_idempotent(&Method::POST));
		assert!(!is_idempotent(&Method::PATCH));
	}

	#[tokio::test]
	async fn untouched_attempt_returns_the_body() {
		let shared = SharedBody::new(Body::from("payload"));
		{
			// Attempt that never polls, e.g. the dial failed.
			let _attempt = shared.attempt();
		}
		assert!(!shared.touched());
		assert!(shared.replayable());

		// The next attempt still sees the full payload.
		let collected = shared.attempt().collect().await.unwrap().to_bytes();
		assert_eq!(collected.as_ref(), b"payload");
	}

	#[tokio::test]
	async fn consumed_body_blocks_replay() {
		let shared = SharedBody::new(Body::from("payload"));
		let _ = shared.attempt().collect().await.unwrap();
		assert!(shared.touched());
		assert!(!shared.replayable());

		// A buggy further attempt surfaces an error rather than a truncated
		// body.
		let err = shared.attempt().collect().await;
		assert!(err.is_err());
	}

	#[tokio::test]
	async fn empty_bodies_are_always_replayable() {
		let shared = SharedBody::new(Body::empty());
		for _ in 0..3 {
			let collected = shared.attempt().collect().await.unwrap().to_bytes();
			assert!(collected.is_empty());
		}
		assert!(!shared.touched());
		assert!(shared.replayable());
	}
}
