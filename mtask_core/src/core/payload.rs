//! Typed payloads and the serialization boundary.
//!
//! Every argument or result that crosses a command, an event or a process
//! boundary implements [`Payload`]. Inside the core the concrete type is erased
//! behind [`Value`], whose small fixed method set (type tag, encode, clone,
//! checked downcast) replaces runtime type inspection. Type mismatches are
//! detected by comparing [`TypeTag`]s before any bytes are decoded.

use crate::core::result::ExecutionResult;
use crate::error::{MtaskError, MtaskResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt;

/// Marker for every type usable as a command argument, result or event payload.
pub trait Payload:
    Any + Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned
{
}

impl<T> Payload for T where
    T: Any + Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned
{
}

/// Stable, serializable identifier of a payload type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeTag(String);

impl TypeTag {
    pub fn of<T: ?Sized + 'static>() -> Self {
        TypeTag(std::any::type_name::<T>().to_string())
    }

    pub fn from_name<S: Into<String>>(name: S) -> Self {
        TypeTag(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Type-erased payload value.
pub trait Value: Any + fmt::Debug + Send + Sync {
    fn type_tag(&self) -> TypeTag;
    fn encode(&self) -> MtaskResult<Vec<u8>>;
    fn clone_value(&self) -> BoxedValue;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

pub type BoxedValue = Box<dyn Value>;

impl<T: Payload> Value for T {
    fn type_tag(&self) -> TypeTag {
        TypeTag::of::<T>()
    }

    fn encode(&self) -> MtaskResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn clone_value(&self) -> BoxedValue {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Checked downcast of an erased value.
pub fn take<T: Payload>(value: BoxedValue) -> Option<T> {
    value.into_any().downcast::<T>().ok().map(|boxed| *boxed)
}

/// Checked borrow of an erased value.
pub fn peek<T: Payload>(value: &dyn Value) -> Option<&T> {
    value.as_any().downcast_ref::<T>()
}

fn decode_boxed<T: Payload>(bytes: &[u8]) -> MtaskResult<BoxedValue> {
    let value: T = bincode::deserialize(bytes)?;
    Ok(Box::new(value))
}

/// Argument or result type of a command, used for type checking and, on the
/// providing side of a proxy, for constructing deserialization targets.
///
/// Descriptors learned from another process only carry the tag.
#[derive(Clone)]
pub struct TypeDescriptor {
    tag: TypeTag,
    type_id: Option<TypeId>,
    decode: Option<fn(&[u8]) -> MtaskResult<BoxedValue>>,
}

impl TypeDescriptor {
    pub fn of<T: Payload>() -> Self {
        Self {
            tag: TypeTag::of::<T>(),
            type_id: Some(TypeId::of::<T>()),
            decode: Some(decode_boxed::<T>),
        }
    }

    /// Descriptor known only by its tag (remote command prototypes)
    pub fn remote(tag: TypeTag) -> Self {
        Self {
            tag,
            type_id: None,
            decode: None,
        }
    }

    pub fn tag(&self) -> &TypeTag {
        &self.tag
    }

    pub fn is_local(&self) -> bool {
        self.decode.is_some()
    }

    pub fn matches<T: Payload>(&self) -> bool {
        match self.type_id {
            Some(id) => id == TypeId::of::<T>(),
            None => self.tag == TypeTag::of::<T>(),
        }
    }

    pub fn matches_value(&self, value: &dyn Value) -> bool {
        match self.type_id {
            Some(id) => value.as_any().type_id() == id,
            None => self.tag == value.type_tag(),
        }
    }

    /// Decode an envelope into a fresh instance of the described type.
    ///
    /// The tag is compared before any byte is read.
    pub fn open(&self, envelope: &Envelope) -> Result<BoxedValue, ExecutionResult> {
        if envelope.type_tag != self.tag {
            return Err(ExecutionResult::InvalidInputType);
        }
        let decode = self.decode.ok_or(ExecutionResult::InvalidInputType)?;
        decode(&envelope.bytes).map_err(|e| {
            log::warn!("failed to decode payload of type {}: {}", self.tag, e);
            ExecutionResult::InvalidInputType
        })
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("tag", &self.tag)
            .field("local", &self.is_local())
            .finish()
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
    }
}

/// Serialized payload tagged with its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub type_tag: TypeTag,
    pub bytes: Vec<u8>,
}

impl Envelope {
    pub fn seal(value: &dyn Value) -> MtaskResult<Self> {
        Ok(Self {
            type_tag: value.type_tag(),
            bytes: value.encode()?,
        })
    }

    pub fn seal_typed<T: Payload>(value: &T) -> MtaskResult<Self> {
        Ok(Self {
            type_tag: TypeTag::of::<T>(),
            bytes: bincode::serialize(value)?,
        })
    }

    /// Decode into `T`, failing when the tag names another type.
    pub fn open_typed<T: Payload>(&self) -> MtaskResult<T> {
        if self.type_tag != TypeTag::of::<T>() {
            return Err(MtaskError::Serialization(format!(
                "payload is {} but {} was expected",
                self.type_tag,
                TypeTag::of::<T>()
            )));
        }
        Ok(bincode::deserialize(&self.bytes)?)
    }
}

/// A reply produced by a command: either still in memory (local call) or
/// serialized (proxy call). Converted to the caller's type at the function.
#[derive(Debug)]
pub enum ReplyValue {
    Local(BoxedValue),
    Encoded(Envelope),
}

impl ReplyValue {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            ReplyValue::Local(value) => value.type_tag(),
            ReplyValue::Encoded(envelope) => envelope.type_tag.clone(),
        }
    }

    pub fn into_typed<T: Payload>(self) -> Result<T, ExecutionResult> {
        match self {
            ReplyValue::Local(value) => take::<T>(value).ok_or(ExecutionResult::InvalidInputType),
            ReplyValue::Encoded(envelope) => envelope
                .open_typed::<T>()
                .map_err(|_| ExecutionResult::InvalidInputType),
        }
    }

    pub fn into_envelope(self) -> MtaskResult<Envelope> {
        match self {
            ReplyValue::Local(value) => Envelope::seal(value.as_ref()),
            ReplyValue::Encoded(envelope) => Ok(envelope),
        }
    }
}
