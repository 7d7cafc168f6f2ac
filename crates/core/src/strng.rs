//! Cheap shared strings. Most identifiers in the router (hostnames, endpoint
//! addresses, instance ids) are created once and cloned often, so they are
//! stored as reference-counted immutable strings.

pub use arcstr::{ArcStr as Strng, format, literal};

pub const EMPTY: Strng = literal!("");

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	Strng::from(s.as_ref())
}
