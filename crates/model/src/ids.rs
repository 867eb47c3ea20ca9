use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::{encode_base64url, random_bytes};

/// Number of random bytes behind a freshly generated block or collection id.
const ID_BYTES: usize = 16;

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

opaque_id! {
    /// Identifies one block. Opaque, globally unique, compared by value.
    BlockId
}

opaque_id! {
    /// Identifies one transaction across every block and peer it touches.
    TrxId
}

opaque_id! {
    /// Identifies one collection; doubles as the id of its header block.
    CollectionId
}

opaque_id! {
    /// Identifies a peer on the network, derived from its public key.
    PeerId
}

impl BlockId {
    /// A fresh id: base64url of 16 random bytes.
    pub fn random() -> Self {
        Self(encode_base64url(random_bytes(ID_BYTES)))
    }
}

impl CollectionId {
    /// A fresh id: base64url of 16 random bytes.
    pub fn random() -> Self {
        Self(encode_base64url(random_bytes(ID_BYTES)))
    }

    /// The id of the collection's header block.
    pub fn header_block_id(&self) -> BlockId {
        BlockId::new(self.0.clone())
    }
}

impl TrxId {
    /// A fresh transaction id.
    ///
    /// Hyphenated UUID v4, so that the id doubles as a storage file stem
    /// (see [`TrxId::is_wellformed`]).
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Whether `stem` looks like a transaction id: five non-empty groups of
    /// word characters separated by `-`. Listings skip files whose stems do
    /// not satisfy this.
    pub fn is_wellformed(stem: &str) -> bool {
        let groups: Vec<&str> = stem.split('-').collect();
        groups.len() == 5
            && groups
                .iter()
                .all(|g| !g.is_empty() && g.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
    }
}
