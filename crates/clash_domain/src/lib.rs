#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod event;
pub mod room;
pub mod session;

pub use event::{GameAction, LifecycleEvent, RoomAction, UserAction};
pub use room::{Room, RoomMember, RoomPhase, UserPresence};
pub use session::{
	DEFAULT_GAME_LENGTH_SECONDS, GameMode, GameOptions, GameSession, GameVisibility, NewGameSession, PlayerMutation,
	PuzzleRef, UpdateOutcome,
};

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Non-empty string identifiers. Deserialization goes through the same validation as `new`.
macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(try_from = "String", into = "String")]
		pub struct $name(String);

		impl $name {
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				if id.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				if id.chars().any(char::is_control) {
					return Err(ParseIdError::InvalidFormat(format!("control characters in {}", stringify!($name))));
				}
				Ok(Self(id))
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}

			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::new(s.to_string())
			}
		}

		impl TryFrom<String> for $name {
			type Error = ParseIdError;

			fn try_from(s: String) -> Result<Self, Self::Error> {
				Self::new(s)
			}
		}

		impl From<$name> for String {
			fn from(id: $name) -> String {
				id.0
			}
		}
	};
}

string_id!(
	/// Stable account identifier issued by the authentication collaborator.
	UserId
);
string_id!(
	/// Display name; also the key for presence and local connections.
	Username
);
string_id!(
	/// Opaque, globally unique lobby room identifier.
	RoomId
);
string_id!(
	/// Persisted game session identifier.
	SessionId
);
string_id!(PuzzleId);

impl RoomId {
	/// Fresh random id, unique across processes.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().simple().to_string())
	}
}

impl SessionId {
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().simple().to_string())
	}
}

/// Authenticated participant, resolved before a connection is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
	pub user_id: UserId,
	pub username: Username,
}

impl Identity {
	pub fn new(user_id: UserId, username: Username) -> Self {
		Self { user_id, username }
	}

	/// Build from raw strings, validating both.
	pub fn parse(user_id: &str, username: &str) -> Result<Self, ParseIdError> {
		Ok(Self::new(user_id.parse()?, username.parse()?))
	}
}

impl fmt::Display for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} ({})", self.username, self.user_id)
	}
}
