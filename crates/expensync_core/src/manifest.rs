//! Store manifest.
//!
//! The manifest is a small binary file describing the store: the schema
//! version and the collections it holds. The journal remains the source of
//! truth for data; the manifest lets tools inspect a store without
//! replaying it and lets `open` detect a downgrade before touching data.

use crate::error::{StoreError, StoreResult};
use crate::migration::SchemaVersion;
use std::collections::BTreeSet;

/// Magic bytes for the manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"EXMF";

/// Current manifest format version.
pub const MANIFEST_VERSION: u16 = 1;

/// Persisted store metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Schema version the store was last opened with.
    pub schema_version: SchemaVersion,
    /// Names of the collections present in the store.
    pub collections: BTreeSet<String>,
}

impl Manifest {
    /// Creates a manifest for `schema_version` with no collections.
    #[must_use]
    pub fn new(schema_version: SchemaVersion) -> Self {
        Self {
            schema_version,
            collections: BTreeSet::new(),
        }
    }

    /// Encodes the manifest.
    ///
    /// Layout: magic, format version (u16), schema version (u32),
    /// collection count (u32), then per collection a u16 length and the
    /// UTF-8 name. Integers are little-endian.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.schema_version.to_le_bytes());

        let count = u32::try_from(self.collections.len()).unwrap_or(u32::MAX);
        buf.extend_from_slice(&count.to_le_bytes());
        for name in &self.collections {
            let bytes = name.as_bytes();
            let len = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&bytes[..usize::from(len)]);
        }
        buf
    }

    /// Decodes a manifest.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidFormat`] on bad magic, an unknown
    /// format version, truncation or trailing bytes.
    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        let mut reader = Reader { data, pos: 0 };

        if reader.take(4)? != MANIFEST_MAGIC {
            return Err(StoreError::invalid_format("invalid manifest magic"));
        }
        let version = u16::from_le_bytes(reader.array()?);
        if version != MANIFEST_VERSION {
            return Err(StoreError::invalid_format(format!(
                "unsupported manifest version {version}"
            )));
        }
        let schema_version = u32::from_le_bytes(reader.array()?);
        let count = u32::from_le_bytes(reader.array()?);

        let mut collections = BTreeSet::new();
        for _ in 0..count {
            let len = u16::from_le_bytes(reader.array()?);
            let name = std::str::from_utf8(reader.take(usize::from(len))?)
                .map_err(|_| StoreError::invalid_format("collection name is not UTF-8"))?;
            collections.insert(name.to_string());
        }

        if reader.pos != data.len() {
            return Err(StoreError::invalid_format("trailing bytes in manifest"));
        }

        Ok(Self {
            schema_version,
            collections,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> StoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| StoreError::invalid_format("manifest too short"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> StoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}
