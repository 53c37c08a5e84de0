//! Commands that flow through the Raft replicated log.
//!
//! An encoded command is one format byte followed by the bincode encoding of
//! [`Command`]. Decoding is strict: any byte sequence that [`Command::encode`]
//! could not have produced is rejected, so two replicas can never read the
//! same committed payload differently.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

const FORMAT_V1: u8 = 1;

/// Largest encoded command accepted by the codec.
pub const MAX_COMMAND_BYTES: u64 = 64 * 1024 * 1024;

/// A client write, replicated verbatim to every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Put {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    Delete {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
    },
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_COMMAND_BYTES)
        .reject_trailing_bytes()
}

impl Command {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Command::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Command::Delete { key: key.into() }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Command::Put { key, .. } | Command::Delete { key } => key,
        }
    }

    fn validate(&self) -> Result<(), CodecError> {
        if self.key().is_empty() {
            return Err(CodecError::EmptyKey);
        }
        Ok(())
    }

    /// Serializes the command into a log payload.
    ///
    /// The output depends only on the command itself, so every node that
    /// encodes the same command produces the same bytes.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.validate()?;
        let mut out = vec![FORMAT_V1];
        codec()
            .serialize_into(&mut out, self)
            .map_err(|err| CodecError::Malformed(err.to_string()))?;
        Ok(out)
    }

    /// Parses a log payload produced by [`Command::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (&version, body) = bytes.split_first().ok_or(CodecError::EmptyPayload)?;
        if version != FORMAT_V1 {
            return Err(CodecError::UnknownVersion(version));
        }
        let command: Command = codec()
            .deserialize(body)
            .map_err(|err| CodecError::Malformed(err.to_string()))?;
        command.validate()?;

        // Varint lengths have more than one spelling; only the canonical one is valid.
        if command.encode()? != bytes {
            return Err(CodecError::Malformed("non-canonical encoding".into()));
        }
        Ok(command)
    }
}
