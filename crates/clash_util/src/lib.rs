#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `ws://host:port` listen endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl WsEndpoint {
		/// Returns `host:port` (IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr`; the host must be an IP literal.
		pub fn to_socket_addr(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal to bind: {}", self.host))
		}

		/// Parse `ws://host:port`. A bare `host:port` is accepted as well.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
			}

			let rest = match s.split_once("://") {
				Some(("ws", rest)) => rest,
				Some((scheme, _)) => {
					return Err(format!("unsupported scheme `{scheme}` (expected ws://host:port): {s}"));
				}
				None => s,
			};

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!("endpoint must not carry a path, query or fragment: {s}"));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("missing :port (expected ws://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("missing host (expected ws://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!("IPv6 hosts must be bracketed like ws://[::1]:18300: {s}"));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.ok()
				.filter(|p| *p != 0)
				.ok_or_else(|| format!("invalid port (expected 1..=65535): {s}"))?;

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_ipv4_with_scheme() {
			let e = WsEndpoint::parse("ws://127.0.0.1:18300").unwrap();
			assert_eq!(e.host, "127.0.0.1");
			assert_eq!(e.port, 18300);
			assert_eq!(e.to_socket_addr().unwrap().to_string(), "127.0.0.1:18300");
		}

		#[test]
		fn accepts_bare_hostport() {
			let e = WsEndpoint::parse("0.0.0.0:9000").unwrap();
			assert_eq!(e.hostport(), "0.0.0.0:9000");
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = WsEndpoint::parse("ws://[::1]:18300").unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.to_socket_addr().unwrap().to_string(), "[::1]:18300");
		}

		#[test]
		fn rejects_other_schemes_and_paths() {
			assert!(WsEndpoint::parse("quic://127.0.0.1:1").unwrap_err().contains("scheme"));
			assert!(WsEndpoint::parse("ws://127.0.0.1:1/ws").is_err());
			assert!(WsEndpoint::parse("ws://::1:18300").unwrap_err().contains("IPv6"));
		}

		#[test]
		fn rejects_port_zero_and_missing_port() {
			assert!(WsEndpoint::parse("ws://127.0.0.1:0").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1").is_err());
		}

		#[test]
		fn dns_names_do_not_bind() {
			let e = WsEndpoint::parse("ws://lobby.example.com:443").unwrap();
			assert!(e.to_socket_addr().is_err());
		}
	}
}

pub mod secret {
	use std::fmt;

	/// String that never shows up in logs.
	#[derive(Clone, PartialEq, Eq)]
	pub struct SecretString(String);

	impl SecretString {
		pub fn new(s: impl Into<String>) -> Self {
			Self(s.into())
		}

		pub fn expose(&self) -> &str {
			&self.0
		}
	}

	impl fmt::Debug for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("SecretString(<redacted>)")
		}
	}

	impl fmt::Display for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("<redacted>")
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn redacts_in_debug_and_display() {
			let s = SecretString::new("hunter2");
			assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
			assert_eq!(s.to_string(), "<redacted>");
			assert_eq!(s.expose(), "hunter2");
		}
	}
}

pub use secret::SecretString;
