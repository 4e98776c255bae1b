//! Messages exchanged between the coordination server and its workers.
//!
//! Every exchange is one worker [`Message`] answered by one server [`Reply`].
//! Both are decoded once at the transport boundary; the server and worker
//! only ever see these typed values.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tessera_common::CacheKey;

use crate::error::DispatchError;

/// Identifies one worker within a distribution round.
pub type WorkerId = usize;

/// Line a worker prints once it is about to contact the server.
pub const CONNECT_MARKER: &str = "<tessera-connect>";

/// Line a worker prints once it has switched all further output to stderr.
/// Text between the two markers is forwarded to the supervisor's log.
pub const STDERR_MARKER: &str = "<tessera-stderr>";

/// Something a worker can ask the server for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resource {
    /// The items of the worker's own keys.
    Items,
    /// A named per-key resource, restricted to the worker's keys.
    Keyed(String),
    /// A named resource shared unchanged by every worker.
    Global(String),
}

/// What a worker's message is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Subject<V> {
    /// First contact. The server answers with the computation descriptor.
    Purpose,
    /// A request for data.
    Request(Resource),
    /// The worker's finished values. Sent exactly once.
    Result(BTreeMap<CacheKey, V>),
    /// A progress line for the server's log.
    Info(String),
}

/// One worker-to-server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<V> {
    /// The sender.
    pub id: WorkerId,
    /// The payload.
    pub subject: Subject<V>,
}

/// The server's answer to one [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply<I, D> {
    /// Answer to [`Subject::Purpose`].
    Purpose(D),
    /// Answer to [`Resource::Items`].
    Items(BTreeMap<CacheKey, I>),
    /// Answer to [`Resource::Keyed`]: encoded values per key.
    Keyed(BTreeMap<CacheKey, Vec<u8>>),
    /// Answer to [`Resource::Global`]: the encoded value.
    Global(Vec<u8>),
    /// Receipt for [`Subject::Result`] and [`Subject::Info`].
    Ack,
    /// The request could not be served.
    Reject(String),
}

/// The keys one worker is responsible for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    /// The assigned worker.
    pub id: WorkerId,
    /// Its keys, in no particular order.
    pub keys: Vec<CacheKey>,
}

/// Extra data served to workers on request, beyond their items.
///
/// Values are stored encoded so the server never needs their types.
#[derive(Debug, Clone, Default)]
pub struct SharedResources {
    keyed: BTreeMap<String, BTreeMap<CacheKey, Vec<u8>>>,
    global: BTreeMap<String, Vec<u8>>,
}

impl SharedResources {
    /// No shared resources.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a per-key resource. Workers receive only their keys' entries.
    pub fn insert_keyed<T: Serialize>(
        &mut self,
        name: impl Into<String>,
        values: &BTreeMap<CacheKey, T>,
    ) -> Result<(), DispatchError> {
        let encoded = values
            .iter()
            .map(|(k, v)| Ok::<_, DispatchError>((k.clone(), encode_value(v)?)))
            .collect::<Result<_, DispatchError>>()?;
        self.keyed.insert(name.into(), encoded);
        Ok(())
    }

    /// Registers a resource every worker receives whole.
    pub fn insert_global<T: Serialize>(
        &mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<(), DispatchError> {
        self.global.insert(name.into(), encode_value(value)?);
        Ok(())
    }

    /// The keyed resource `name` restricted to `keys`.
    pub fn keyed_slice(
        &self,
        name: &str,
        keys: &[CacheKey],
    ) -> Option<BTreeMap<CacheKey, Vec<u8>>> {
        let all = self.keyed.get(name)?;
        Some(
            keys.iter()
                .filter_map(|k| all.get(k).map(|v| (k.clone(), v.clone())))
                .collect(),
        )
    }

    /// The global resource `name`.
    pub fn global(&self, name: &str) -> Option<&[u8]> {
        self.global.get(name).map(Vec::as_slice)
    }
}

/// Encodes a shared-resource value.
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, DispatchError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(|e| {
        DispatchError::Frame {
            reason: e.to_string(),
        }
    })
}

/// Decodes a shared-resource value received from the server.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DispatchError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| DispatchError::Frame {
            reason: e.to_string(),
        })
}
