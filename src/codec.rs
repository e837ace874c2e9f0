//! # Value Codec and Class Registry Module
//!
//! Objects cross the wire as bytes produced by a pluggable codec. Both ends
//! register the transmittable types with the process-global [`ClassRegistry`],
//! which assigns stable `u16` class codes in registration order; the code
//! travels as a two-byte prefix inside the object payload so the receiver
//! knows which registered type to decode into.
//!
//! Two codecs ship in-crate: method 0 encodes with `bincode`, method 1 with
//! `serde_json`. Method 2 selects a user-supplied [`Codec`] installed with
//! [`set_custom_codec`]. Received values surface as `Box<dyn Any + Send + Sync>`
//! and are downcast by the application.

use crate::error::TransportError;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// A value that can be handed to `send_object`
pub type AnyValue = Box<dyn Any + Send + Sync>;

type EncodeFn = fn(&(dyn Any + Send + Sync)) -> Result<Vec<u8>, TransportError>;
type DecodeFn = fn(&[u8]) -> Result<AnyValue, TransportError>;

struct ClassEntry {
    name: &'static str,
    to_bincode: EncodeFn,
    from_bincode: DecodeFn,
    to_json: EncodeFn,
    from_json: DecodeFn,
}

/// Registry of transmittable types; codes are assigned in registration order
/// and must match on both ends of a connection.
#[derive(Default)]
pub struct ClassRegistry {
    entries: Vec<ClassEntry>,
    by_type: HashMap<TypeId, u16>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`, returning its class code. Registering the same type
    /// twice returns the original code.
    pub fn register<T>(&mut self, name: &'static str) -> u16
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        if let Some(&code) = self.by_type.get(&TypeId::of::<T>()) {
            return code;
        }
        let code = self.entries.len() as u16;
        self.entries.push(ClassEntry {
            name,
            to_bincode: encode_bincode::<T>,
            from_bincode: decode_bincode::<T>,
            to_json: encode_json::<T>,
            from_json: decode_json::<T>,
        });
        self.by_type.insert(TypeId::of::<T>(), code);
        code
    }

    /// Class code for a boxed value, by its concrete type
    pub fn code_of(&self, value: &(dyn Any + Send + Sync)) -> Option<u16> {
        self.by_type.get(&value.type_id()).copied()
    }

    pub fn code_for<T: 'static>(&self) -> Option<u16> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn name_of(&self, code: u16) -> Option<&'static str> {
        self.entries.get(code as usize).map(|e| e.name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, code: u16) -> Result<&ClassEntry, TransportError> {
        self.entries.get(code as usize).ok_or_else(|| {
            TransportError::Serialization(format!("class code {} is not registered", code))
        })
    }
}

fn encode_bincode<T: Serialize + Send + Sync + 'static>(
    value: &(dyn Any + Send + Sync),
) -> Result<Vec<u8>, TransportError> {
    let value = value
        .downcast_ref::<T>()
        .ok_or_else(|| TransportError::Serialization("value does not match its class code".into()))?;
    bincode::serialize(value).map_err(|e| TransportError::Serialization(e.to_string()))
}

fn decode_bincode<T: DeserializeOwned + Send + Sync + 'static>(
    bytes: &[u8],
) -> Result<AnyValue, TransportError> {
    let value: T =
        bincode::deserialize(bytes).map_err(|e| TransportError::Serialization(e.to_string()))?;
    Ok(Box::new(value))
}

fn encode_json<T: Serialize + Send + Sync + 'static>(
    value: &(dyn Any + Send + Sync),
) -> Result<Vec<u8>, TransportError> {
    let value = value
        .downcast_ref::<T>()
        .ok_or_else(|| TransportError::Serialization("value does not match its class code".into()))?;
    serde_json::to_vec(value).map_err(|e| TransportError::Serialization(e.to_string()))
}

fn decode_json<T: DeserializeOwned + Send + Sync + 'static>(
    bytes: &[u8],
) -> Result<AnyValue, TransportError> {
    let value: T =
        serde_json::from_slice(bytes).map_err(|e| TransportError::Serialization(e.to_string()))?;
    Ok(Box::new(value))
}

/// Byte codec for registered values. Implement this for serialization
/// method 2; methods 0 and 1 are provided by [`BincodeCodec`] and
/// [`JsonCodec`].
pub trait Codec: Send + Sync {
    /// The method code this codec answers to (0..=2)
    fn method(&self) -> u8;

    fn encode(
        &self,
        registry: &ClassRegistry,
        code: u16,
        value: &(dyn Any + Send + Sync),
    ) -> Result<Vec<u8>, TransportError>;

    fn decode(
        &self,
        registry: &ClassRegistry,
        code: u16,
        bytes: &[u8],
    ) -> Result<AnyValue, TransportError>;
}

/// Serialization method 0
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn method(&self) -> u8 {
        0
    }

    fn encode(
        &self,
        registry: &ClassRegistry,
        code: u16,
        value: &(dyn Any + Send + Sync),
    ) -> Result<Vec<u8>, TransportError> {
        (registry.entry(code)?.to_bincode)(value)
    }

    fn decode(
        &self,
        registry: &ClassRegistry,
        code: u16,
        bytes: &[u8],
    ) -> Result<AnyValue, TransportError> {
        (registry.entry(code)?.from_bincode)(bytes)
    }
}

/// Serialization method 1
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn method(&self) -> u8 {
        1
    }

    fn encode(
        &self,
        registry: &ClassRegistry,
        code: u16,
        value: &(dyn Any + Send + Sync),
    ) -> Result<Vec<u8>, TransportError> {
        (registry.entry(code)?.to_json)(value)
    }

    fn decode(
        &self,
        registry: &ClassRegistry,
        code: u16,
        bytes: &[u8],
    ) -> Result<AnyValue, TransportError> {
        (registry.entry(code)?.from_json)(bytes)
    }
}

static REGISTRY: OnceLock<RwLock<ClassRegistry>> = OnceLock::new();
static CUSTOM_CODEC: OnceLock<RwLock<Option<Arc<dyn Codec>>>> = OnceLock::new();

/// The process-global class registry
pub fn registry() -> &'static RwLock<ClassRegistry> {
    REGISTRY.get_or_init(|| RwLock::new(ClassRegistry::new()))
}

/// Register `T` with the global registry and return its class code
pub fn register_class<T>(name: &'static str) -> u16
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    registry().write().register::<T>(name)
}

/// Install the codec used for serialization method 2
pub fn set_custom_codec(codec: Arc<dyn Codec>) {
    *CUSTOM_CODEC
        .get_or_init(|| RwLock::new(None))
        .write() = Some(codec);
}

/// Resolve a serialization method code to a codec instance
pub(crate) fn resolve(method: u8) -> Result<Arc<dyn Codec>, TransportError> {
    match method {
        0 => Ok(Arc::new(BincodeCodec)),
        1 => Ok(Arc::new(JsonCodec)),
        2 => CUSTOM_CODEC
            .get_or_init(|| RwLock::new(None))
            .read()
            .clone()
            .ok_or_else(|| {
                TransportError::Config("serialization method 2 selected but no custom codec installed".into())
            }),
        other => Err(TransportError::Config(format!(
            "unknown serialization method {}",
            other
        ))),
    }
}

/// Restore factory state; used by tests
pub fn reset() {
    if let Some(lock) = REGISTRY.get() {
        *lock.write() = ClassRegistry::new();
    }
    if let Some(lock) = CUSTOM_CODEC.get() {
        *lock.write() = None;
    }
}
