// Storage module - named-stream container and its on-disk form

mod file;
pub mod stream_name;

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use file::{load_storage, save_storage, write_storage};
pub use stream_name::{decode_stream_name, encode_stream_name};

/// Root class id of an installer database.
pub const CLSID_MSI_DATABASE: Uuid = Uuid::from_u128(0x000c_1084_0000_0000_c000_0000_0000_0046);
/// Root class id of a patch package.
pub const CLSID_MSI_PATCH: Uuid = Uuid::from_u128(0x000c_1086_0000_0000_c000_0000_0000_0046);
/// Root class id of a transform.
pub const CLSID_MSI_TRANSFORM: Uuid = Uuid::from_u128(0x000c_1082_0000_0000_c000_0000_0000_0046);

/// A directory of named byte streams and nested storages.
///
/// Stream names are stored exactly as given (table streams use the
/// encoded form produced by [`encode_stream_name`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Storage {
    pub class_id: Uuid,
    streams: BTreeMap<String, Bytes>,
    storages: BTreeMap<String, Storage>,
}

impl Storage {
    #[must_use]
    pub fn new(class_id: Uuid) -> Self {
        Self {
            class_id,
            streams: BTreeMap::new(),
            storages: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn stream(&self, name: &str) -> Option<&Bytes> {
        self.streams.get(name)
    }

    pub fn set_stream(&mut self, name: &str, data: impl Into<Bytes>) {
        self.streams.insert(name.to_string(), data.into());
    }

    pub fn remove_stream(&mut self, name: &str) -> Option<Bytes> {
        self.streams.remove(name)
    }

    pub fn streams(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.streams.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn storage(&self, name: &str) -> Option<&Self> {
        self.storages.get(name)
    }

    pub fn set_storage(&mut self, name: &str, storage: Self) {
        self.storages.insert(name.to_string(), storage);
    }

    pub fn remove_storage(&mut self, name: &str) -> Option<Self> {
        self.storages.remove(name)
    }

    pub fn storages(&self) -> impl Iterator<Item = (&str, &Self)> {
        self.storages.iter().map(|(k, v)| (k.as_str(), v))
    }
}
