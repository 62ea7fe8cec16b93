//! Wire format of the plug-in protocol.
//!
//! One request and one reply per exchange, each a bare JSON object on a TCP
//! stream with no length prefix and no delimiter:
//!
//! ```text
//! → {"operation": "create_beam", "args": {"p1": [0,0,0], ...}}
//! ← {"status": "ok", "id": 7}
//! ← {"status": "error", "message": "unknown operation 'foo'"}
//! ```
//!
//! Message boundaries are recovered by [`frame::FrameReader`].

pub mod frame;

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};

use crate::error::CommandError;

pub use frame::{read_frame, FrameReader};

/// Operation-specific fields carried by a command or an ok response.
pub type Fields = Map<String, Value>;

/// Error text used when a peer's error response carries no description.
const UNDESCRIBED_ERROR: &str = "plug-in reported an error without a message";

/// One request envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    operation: String,
    args: Fields,
}

impl Command {
    /// Creates a command.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Structural`] if `operation` is empty.
    pub fn new(operation: impl Into<String>, args: Fields) -> Result<Self, CommandError> {
        let operation = operation.into();
        if operation.is_empty() {
            return Err(CommandError::Structural(
                "'operation' must be a non-empty string".to_string(),
            ));
        }
        Ok(Self { operation, args })
    }

    /// Validates a parsed document as a command envelope.
    ///
    /// The checks run in a fixed order: the document must be an object,
    /// `operation` must be a non-empty string, and `args` (if present) must be
    /// an object. A missing `args` becomes an empty map.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Structural`] describing the first failed check.
    pub fn from_document(document: Value) -> Result<Self, CommandError> {
        let Value::Object(mut envelope) = document else {
            return Err(CommandError::Structural(
                "invalid message format, expected JSON object".to_string(),
            ));
        };

        let operation = match envelope.remove("operation") {
            Some(Value::String(op)) if !op.is_empty() => op,
            Some(Value::String(_)) => {
                return Err(CommandError::Structural(
                    "'operation' must be a non-empty string".to_string(),
                ))
            }
            Some(_) => {
                return Err(CommandError::Structural(
                    "'operation' must be a string".to_string(),
                ))
            }
            None => {
                return Err(CommandError::Structural(
                    "missing 'operation' field".to_string(),
                ))
            }
        };

        let args = match envelope.remove("args") {
            None => Fields::new(),
            Some(Value::Object(args)) => args,
            Some(_) => {
                return Err(CommandError::Structural(
                    "invalid 'args' format, expected JSON object".to_string(),
                ))
            }
        };

        Ok(Self { operation, args })
    }

    /// The operation name.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// The command arguments.
    #[must_use]
    pub const fn args(&self) -> &Fields {
        &self.args
    }

    /// Encodes the command as compact JSON bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut envelope = Fields::new();
        envelope.insert("operation".to_string(), Value::String(self.operation.clone()));
        envelope.insert("args".to_string(), Value::Object(self.args.clone()));
        Value::Object(envelope).to_string().into_bytes()
    }
}

/// One reply envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The operation succeeded; the fields are merged into the envelope.
    Ok(Fields),
    /// The operation failed; `message` describes why.
    Error {
        /// Human-readable description.
        message: String,
    },
}

impl Response {
    /// Creates a successful response.
    #[must_use]
    pub const fn ok(fields: Fields) -> Self {
        Self::Ok(fields)
    }

    /// Creates an error response.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Returns `true` for an ok response.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Returns a field of an ok response.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Ok(fields) => fields.get(key),
            Self::Error { .. } => None,
        }
    }

    /// Returns the error message of an error response.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Ok(_) => None,
            Self::Error { message } => Some(message),
        }
    }

    /// Converts the response to its JSON envelope.
    ///
    /// `status` is written last so handler fields can never override it.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut envelope = Fields::new();
        match self {
            Self::Ok(fields) => {
                envelope.extend(fields.clone());
                envelope.insert("status".to_string(), Value::from("ok"));
            }
            Self::Error { message } => {
                envelope.insert("message".to_string(), Value::from(message.as_str()));
                envelope.insert("status".to_string(), Value::from("error"));
            }
        }
        Value::Object(envelope)
    }

    /// Encodes the response as compact JSON bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_value().to_string().into_bytes()
    }

    /// Decodes a response envelope received from a peer.
    ///
    /// Error text is taken from `message`, falling back to `msg`.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the document is not an object
    /// or has no valid `status`.
    pub fn from_document(document: Value) -> Result<Self, String> {
        let Value::Object(mut envelope) = document else {
            return Err("response is not a JSON object".to_string());
        };

        match envelope.remove("status") {
            Some(Value::String(status)) if status == "ok" => Ok(Self::Ok(envelope)),
            Some(Value::String(status)) if status == "error" => {
                let message = ["message", "msg"]
                    .iter()
                    .find_map(|key| envelope.get(*key).and_then(Value::as_str))
                    .unwrap_or(UNDESCRIBED_ERROR);
                Ok(Self::error(message))
            }
            Some(other) => Err(format!("unexpected response status {other}")),
            None => Err("response has no 'status' field".to_string()),
        }
    }
}

impl From<CommandError> for Response {
    fn from(error: CommandError) -> Self {
        Self::error(error.to_string())
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let Value::Object(envelope) = self.to_value() else {
            return serializer.serialize_none();
        };
        let mut map = serializer.serialize_map(Some(envelope.len()))?;
        for (key, value) in &envelope {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}
