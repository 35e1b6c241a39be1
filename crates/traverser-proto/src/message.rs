//! Rendezvous message definitions.
//!
//! Messages are a single line of ASCII text: a verb followed by
//! whitespace-separated argument tokens. There is no escaping, so arguments can
//! never contain whitespace. Leading/trailing whitespace and newlines are
//! ignored.
//!
//! | Verb     | Arguments               |
//! |----------|-------------------------|
//! | `add`    | public key, tunnel IP   |
//! | `get`    | public key              |
//! | `peer`   | compact JSON descriptor |
//! | `remove` | none                    |
//! | `exit`   | none                    |
//!
//! Decoding never fails. Anything that does not match one of the verbs above
//! with exactly the listed arity decodes to [`Message::Unknown`], which
//! handlers treat as a no-op.

use crate::descriptor::PeerDescriptor;
use crate::error::ProtoError;
use crate::key::PublicKey;
use std::fmt;
use std::net::IpAddr;

/// `add <public_key> <address>`
pub const ADD_VERB: &str = "add";
/// `get <public_key>`
pub const GET_VERB: &str = "get";
/// `peer <json>`
pub const PEER_VERB: &str = "peer";
/// `remove`
pub const REMOVE_VERB: &str = "remove";
/// `exit`
pub const EXIT_VERB: &str = "exit";

/// Rendezvous protocol messages.
///
/// Arguments are kept as the raw tokens received; handlers parse them into
/// typed values and drop the message if that fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Registration (client to server) or registration ack (server to client)
    Add {
        /// Sender's public key
        public_key: String,
        /// Sender's tunnel address
        address: String,
    },

    /// Request for another peer's descriptor
    Get {
        /// Key of the requested peer
        public_key: String,
    },

    /// Descriptor response
    Peer {
        /// Compact JSON [`PeerDescriptor`]
        descriptor: String,
    },

    /// Deregistration hint
    Remove,

    /// Session termination hint
    Exit,

    /// Unrecognized verb or wrong arity
    Unknown {
        /// First token (empty for a blank datagram)
        verb: String,
        /// Remaining tokens
        args: Vec<String>,
    },
}

impl Message {
    /// Build an `add` message from typed values.
    #[must_use]
    pub fn add(public_key: &PublicKey, address: IpAddr) -> Self {
        Message::Add {
            public_key: public_key.to_base64(),
            address: address.to_string(),
        }
    }

    /// Build a `get` message for the given peer.
    #[must_use]
    pub fn get(public_key: &PublicKey) -> Self {
        Message::Get {
            public_key: public_key.to_base64(),
        }
    }

    /// Build a `peer` message carrying `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns `ProtoError::InvalidDescriptor` if the descriptor cannot be serialized.
    pub fn peer(descriptor: &PeerDescriptor) -> Result<Self, ProtoError> {
        Ok(Message::Peer {
            descriptor: descriptor.to_json()?,
        })
    }

    /// Decode a message from text.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut tokens = text.split_whitespace();
        let verb = tokens.next().unwrap_or_default();
        let args: Vec<&str> = tokens.collect();

        match (verb, args.as_slice()) {
            (ADD_VERB, [public_key, address]) => Message::Add {
                public_key: (*public_key).to_string(),
                address: (*address).to_string(),
            },
            (GET_VERB, [public_key]) => Message::Get {
                public_key: (*public_key).to_string(),
            },
            (PEER_VERB, [descriptor]) => Message::Peer {
                descriptor: (*descriptor).to_string(),
            },
            (REMOVE_VERB, []) => Message::Remove,
            (EXIT_VERB, []) => Message::Exit,
            _ => Message::Unknown {
                verb: verb.to_string(),
                args: args.into_iter().map(str::to_string).collect(),
            },
        }
    }

    /// Decode a message from a datagram payload.
    ///
    /// Invalid UTF-8 is replaced rather than rejected; such payloads end up as
    /// [`Message::Unknown`] or fail later when their arguments are parsed.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::parse(&String::from_utf8_lossy(bytes))
    }

    /// Encode to a datagram payload.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// The verb as it appears on the wire.
    #[must_use]
    pub fn verb(&self) -> &str {
        match self {
            Message::Add { .. } => ADD_VERB,
            Message::Get { .. } => GET_VERB,
            Message::Peer { .. } => PEER_VERB,
            Message::Remove => REMOVE_VERB,
            Message::Exit => EXIT_VERB,
            Message::Unknown { verb, .. } => verb,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())?;
        match self {
            Message::Add {
                public_key,
                address,
            } => write!(f, " {public_key} {address}"),
            Message::Get { public_key } => write!(f, " {public_key}"),
            Message::Peer { descriptor } => write!(f, " {descriptor}"),
            Message::Remove | Message::Exit => Ok(()),
            Message::Unknown { args, .. } => {
                for arg in args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
        }
    }
}
