// Copyright 2023 The Kirin Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

/// The number of hex characters shown for abbreviated ids.
pub const SHORT_HEX_LEN: usize = 8;

pub trait ObjectId {
    fn object_type(&self) -> String;
    fn as_bytes(&self) -> &[u8];
    fn to_bytes(&self) -> Vec<u8>;
    fn hex(&self) -> String;

    /// First [`SHORT_HEX_LEN`] hex characters, for display only.
    fn short_hex(&self) -> String {
        let mut hex = self.hex();
        hex.truncate(SHORT_HEX_LEN);
        hex
    }
}

// Defines a new struct type with visibility `vis` and name `ident` containing
// a single Vec<u8> used to store an identifier (the output of a hash
// function) as bytes. Types defined using this macro automatically implement
// the `ObjectId` trait and serialize as lowercase hex strings.
// Documentation comments written inside the macro definition will be captured
// and associated with the type defined by the macro.
//
// Example:
// ```no_run
// id_type!(
//     /// My favorite id type.
//     pub MyId
// );
// ```
macro_rules! id_type {
    (   $(#[$attr:meta])*
        $vis:vis $name:ident
    ) => {
        $(#[$attr])*
        #[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
        $vis struct $name(Vec<u8>);
        $crate::object_id::impl_id_type!($name);
    };
}

macro_rules! impl_id_type {
    ($name:ident) => {
        #[allow(dead_code)]
        impl $name {
            pub fn new(value: Vec<u8>) -> Self {
                Self(value)
            }

            pub fn from_bytes(bytes: &[u8]) -> Self {
                Self(bytes.to_vec())
            }

            /// Parses the given hex string into an id.
            ///
            /// The given string must be valid. A static str is required to
            /// prevent API misuse.
            pub fn from_hex(hex: &'static str) -> Self {
                Self::try_from_hex(hex).unwrap()
            }

            /// Parses the given hex string into an id.
            pub fn try_from_hex(hex: impl AsRef<[u8]>) -> Option<Self> {
                hex::decode(hex).ok().map(Self)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                use $crate::object_id::ObjectId as _;
                f.debug_tuple(stringify!($name)).field(&self.hex()).finish()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                use $crate::object_id::ObjectId as _;
                f.pad(&self.hex())
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                use $crate::object_id::ObjectId as _;
                if serializer.is_human_readable() {
                    self.hex().serialize(serializer)
                } else {
                    self.as_bytes().serialize(serializer)
                }
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                use serde::Deserialize as _;
                if deserializer.is_human_readable() {
                    let hex = String::deserialize(deserializer)?;
                    Self::try_from_hex(&hex).ok_or_else(|| {
                        serde::de::Error::custom(format!("invalid hex id: {hex}"))
                    })
                } else {
                    Vec::<u8>::deserialize(deserializer).map(Self)
                }
            }
        }

        impl $crate::object_id::ObjectId for $name {
            fn object_type(&self) -> String {
                stringify!($name)
                    .strip_suffix("Id")
                    .unwrap()
                    .to_ascii_lowercase()
                    .to_string()
            }

            fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            fn to_bytes(&self) -> Vec<u8> {
                self.0.clone()
            }

            fn hex(&self) -> String {
                hex::encode(&self.0)
            }
        }
    };
}

pub(crate) use id_type;
pub(crate) use impl_id_type;

id_type!(
    /// Identifier for a blob in the content store: the SHA-256 of its bytes.
    pub BlobId
);
id_type!(
    /// Identifier for a [`Commit`](crate::commit::Commit), the SHA-256 of its
    /// canonical serialization.
    pub CommitId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_object_id() {
        let blob_id = BlobId::from_hex("deadbeef0123");
        assert_eq!(format!("{blob_id}"), "deadbeef0123");
        assert_eq!(format!("{blob_id:.6}"), "deadbe");

        let commit_id = CommitId::from_hex("0123456789abcdef0011");
        assert_eq!(commit_id.short_hex(), "01234567");
    }

    #[test]
    fn test_object_type() {
        assert_eq!(BlobId::from_hex("ab").object_type(), "blob");
        assert_eq!(CommitId::from_hex("ab").object_type(), "commit");
    }

    #[test]
    fn test_try_from_hex() {
        assert_eq!(
            BlobId::try_from_hex("1234"),
            Some(BlobId::from_bytes(&[0x12, 0x34]))
        );
        assert_eq!(BlobId::try_from_hex("0x123"), None);
        assert_eq!(BlobId::try_from_hex("foobar"), None);
    }

    #[test]
    fn test_serde_hex_round_trip() {
        let id = BlobId::from_hex("00ff10");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00ff10\"");
        let parsed: BlobId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
