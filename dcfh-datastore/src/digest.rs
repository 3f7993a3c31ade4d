//! Registry of the digest algorithms an index may use.

use anyhow::{format_err, Error};
use openssl::hash::{Hasher, MessageDigest};

pub const HASH_TYPE_NONE: u16 = 0;
pub const HASH_TYPE_SHA1: u16 = 1;
pub const HASH_TYPE_SHA256: u16 = 2;
pub const HASH_TYPE_SHA512: u16 = 3;

/// One registered digest algorithm.
pub struct DigestKind {
    pub name: &'static str,
    pub type_id: u16,
    pub digest_size: usize,
}

pub static DIGEST_KINDS: [DigestKind; 3] = [
    DigestKind {
        name: "sha1",
        type_id: HASH_TYPE_SHA1,
        digest_size: 20,
    },
    DigestKind {
        name: "sha256",
        type_id: HASH_TYPE_SHA256,
        digest_size: 32,
    },
    DigestKind {
        name: "sha512",
        type_id: HASH_TYPE_SHA512,
        digest_size: 64,
    },
];

/// Name lookup is case-insensitive.
pub fn digest_by_name(name: &str) -> Option<&'static DigestKind> {
    DIGEST_KINDS
        .iter()
        .find(|kind| kind.name.eq_ignore_ascii_case(name))
}

pub fn digest_by_type(type_id: u16) -> Option<&'static DigestKind> {
    DIGEST_KINDS.iter().find(|kind| kind.type_id == type_id)
}

impl DigestKind {
    fn message_digest(&self) -> MessageDigest {
        match self.type_id {
            HASH_TYPE_SHA1 => MessageDigest::sha1(),
            HASH_TYPE_SHA256 => MessageDigest::sha256(),
            HASH_TYPE_SHA512 => MessageDigest::sha512(),
            _ => unreachable!("unregistered digest type"),
        }
    }

    /// Incremental digest state.
    pub fn create(&self) -> Result<Hasher, Error> {
        Hasher::new(self.message_digest())
            .map_err(|err| format_err!("unable to create {} hasher - {}", self.name, err))
    }

    /// One-shot digest over a byte slice.
    pub fn digest(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let bytes = openssl::hash::hash(self.message_digest(), data)
            .map_err(|err| format_err!("{} digest failed - {}", self.name, err))?;
        Ok(bytes.to_vec())
    }
}
