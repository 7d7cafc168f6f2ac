use std::fmt;
use std::fmt::{Display, Formatter};

#[derive(serde::Serialize, Clone, Debug)]
pub struct BuildInfo {
	pub version: &'static str,
	pub rust_version: &'static str,
	pub build_profile: &'static str,
}

impl BuildInfo {
	pub fn new() -> Self {
		BuildInfo {
			version: env!("CARGO_PKG_VERSION"),
			rust_version: env!("CARGO_PKG_RUST_VERSION"),
			build_profile: if cfg!(debug_assertions) {
				"debug"
			} else {
				"release"
			},
		}
	}
}

impl Default for BuildInfo {
	fn default() -> Self {
		Self::new()
	}
}

impl Display for BuildInfo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"version.BuildInfo{{Version:\"{}\", RustVersion:\"{}\", BuildProfile:\"{}\"}}",
			self.version, self.rust_version, self.build_profile
		)
	}
}
