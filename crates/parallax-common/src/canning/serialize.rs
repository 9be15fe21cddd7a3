//! Object serialization with out-of-band buffers.
//!
//! An object becomes a list of frames. The first frame describes the object;
//! large payloads follow as separate frames so they can be sent without
//! being copied into the description. Placeholders in the description are
//! refilled from the following frames in order.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use super::can::{can, uncan, Canned};
use super::object::{DType, NdArray, Object};
use super::{CanningConfig, CanningError};

/// How a serialized value's data is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeDescriptor {
    Pickle,
    NdArray,
    Bytes,
    Buffer,
}

/// Array layout, present for [`TypeDescriptor::NdArray`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub dtype: Option<DType>,
    pub shape: Option<Vec<usize>>,
}

/// One serialized value. `data` is `None` when the payload is out-of-band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedValue {
    pub type_descriptor: TypeDescriptor,
    pub metadata: Metadata,
    pub data: Option<Bytes>,
}

#[derive(Debug, Serialize, Deserialize)]
enum SerializedObject {
    Single(SerializedValue),
    Sequence {
        tuple: bool,
        items: Vec<SerializedValue>,
    },
    Mapping {
        keys: Vec<String>,
        values: Vec<SerializedValue>,
    },
}

/// Serializes one canned value, appending any out-of-band payload to `buffers`.
fn serialize_value(
    canned: Canned,
    config: &CanningConfig,
    buffers: &mut Vec<Bytes>,
) -> Result<SerializedValue, CanningError> {
    let (type_descriptor, metadata, data, always_extract) = match canned {
        Canned::Value(Object::Array(arr)) => (
            TypeDescriptor::NdArray,
            Metadata {
                dtype: Some(arr.dtype()),
                shape: Some(arr.shape().to_vec()),
            },
            arr.data().clone(),
            true,
        ),
        Canned::Value(Object::Buffer(buf)) => (TypeDescriptor::Buffer, Metadata::default(), buf, true),
        Canned::Value(Object::Bytes(buf)) => (TypeDescriptor::Bytes, Metadata::default(), buf, false),
        other => (
            TypeDescriptor::Pickle,
            Metadata::default(),
            Bytes::from(postcard::to_allocvec(&other)?),
            false,
        ),
    };

    let data = if always_extract || data.len() > config.buffer_threshold {
        buffers.push(data);
        None
    } else {
        Some(data)
    };

    Ok(SerializedValue {
        type_descriptor,
        metadata,
        data,
    })
}

fn unserialize_value(
    value: SerializedValue,
    buffers: &mut VecDeque<Bytes>,
) -> Result<Canned, CanningError> {
    let data = match value.data {
        Some(data) => data,
        None => buffers.pop_front().ok_or(CanningError::MissingBuffer)?,
    };

    match value.type_descriptor {
        TypeDescriptor::Pickle => Ok(postcard::from_bytes(&data)?),
        TypeDescriptor::Bytes => Ok(Canned::Value(Object::Bytes(data))),
        TypeDescriptor::Buffer => Ok(Canned::Value(Object::Buffer(data))),
        TypeDescriptor::NdArray => {
            let (Some(dtype), Some(shape)) = (value.metadata.dtype, value.metadata.shape) else {
                return Err(CanningError::Malformed(
                    "ndarray without dtype/shape metadata".to_string(),
                ));
            };
            Ok(Canned::Value(Object::Array(NdArray::new(dtype, shape, data)?)))
        }
    }
}

/// Serializes an object into frames: a description followed by any
/// out-of-band buffers.
///
/// Short sequences and mappings have each element serialized on its own,
/// so large elements are extracted individually.
pub fn serialize_object(obj: &Object, config: &CanningConfig) -> Result<Vec<Bytes>, CanningError> {
    let mut buffers = Vec::new();

    let description = match obj {
        Object::List(items) | Object::Tuple(items) if items.len() < config.item_threshold => {
            let mut serialized = Vec::with_capacity(items.len());
            for item in items {
                serialized.push(serialize_value(can(item, config), config, &mut buffers)?);
            }
            SerializedObject::Sequence {
                tuple: matches!(obj, Object::Tuple(_)),
                items: serialized,
            }
        }
        Object::Dict(map) if map.len() < config.item_threshold => {
            // BTreeMap iteration is already sorted by key.
            let mut keys = Vec::with_capacity(map.len());
            let mut values = Vec::with_capacity(map.len());
            for (key, value) in map {
                keys.push(key.clone());
                values.push(serialize_value(can(value, config), config, &mut buffers)?);
            }
            SerializedObject::Mapping { keys, values }
        }
        other => SerializedObject::Single(serialize_value(can(other, config), config, &mut buffers)?),
    };

    let mut frames = Vec::with_capacity(buffers.len() + 1);
    frames.push(Bytes::from(postcard::to_allocvec(&description)?));
    frames.extend(buffers);
    Ok(frames)
}

/// Reconstructs one object from the front of `buffers`.
///
/// Consumes the description frame and exactly the out-of-band frames it
/// refers to; anything after them is left in place.
pub fn unserialize_object(buffers: &mut VecDeque<Bytes>) -> Result<Object, CanningError> {
    let head = buffers.pop_front().ok_or(CanningError::MissingBuffer)?;
    let description: SerializedObject = postcard::from_bytes(&head)?;

    let obj = match description {
        SerializedObject::Single(value) => uncan(unserialize_value(value, buffers)?),
        SerializedObject::Sequence { tuple, items } => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(uncan(unserialize_value(item, buffers)?));
            }
            if tuple {
                Object::Tuple(out)
            } else {
                Object::List(out)
            }
        }
        SerializedObject::Mapping { keys, values } => {
            if keys.len() != values.len() {
                return Err(CanningError::Malformed(format!(
                    "{} keys for {} values",
                    keys.len(),
                    values.len()
                )));
            }
            let mut map = BTreeMap::new();
            for (key, value) in keys.into_iter().zip(values) {
                map.insert(key, uncan(unserialize_value(value, buffers)?));
            }
            Object::Dict(map)
        }
    };
    Ok(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(obj: &Object, config: &CanningConfig) -> (usize, Object) {
        let frames = serialize_object(obj, config).unwrap();
        let count = frames.len();
        let mut queue: VecDeque<Bytes> = frames.into();
        let back = unserialize_object(&mut queue).unwrap();
        assert!(queue.is_empty());
        (count, back)
    }

    #[test]
    fn test_small_value_is_one_frame() {
        let obj = Object::Str("hello".to_string());
        let (count, back) = round_trip(&obj, &CanningConfig::default());
        assert_eq!(count, 1);
        assert_eq!(back, obj);
    }

    #[test]
    fn test_large_bytes_are_extracted() {
        let payload = Bytes::from(vec![7u8; 4096]);
        let obj = Object::Bytes(payload.clone());
        let frames = serialize_object(&obj, &CanningConfig::default()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], payload);

        let mut queue: VecDeque<Bytes> = frames.into();
        assert_eq!(unserialize_object(&mut queue).unwrap(), obj);
    }

    #[test]
    fn test_arrays_always_extracted() {
        let arr = NdArray::from_f64(vec![2], &[1.0, 2.0]).unwrap();
        let obj = Object::Array(arr.clone());
        let (count, back) = round_trip(&obj, &CanningConfig::default());
        assert_eq!(count, 2);
        assert_eq!(back, obj);
    }

    #[test]
    fn test_sequence_extracts_each_element() {
        let big = Object::Bytes(Bytes::from(vec![1u8; 2000]));
        let obj = Object::Tuple(vec![
            Object::Int(1),
            big.clone(),
            Object::Buffer(Bytes::from_static(b"raw")),
        ]);
        let (count, back) = round_trip(&obj, &CanningConfig::default());
        assert_eq!(count, 3);
        assert_eq!(back, obj);
    }

    #[test]
    fn test_mapping_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), Object::Int(2));
        map.insert("a".to_string(), Object::Array(NdArray::from_f64(vec![1], &[3.0]).unwrap()));
        let obj = Object::Dict(map);
        let (count, back) = round_trip(&obj, &CanningConfig::default());
        assert_eq!(count, 2);
        assert_eq!(back, obj);
    }

    #[test]
    fn test_threshold_is_configurable() {
        let config = CanningConfig {
            buffer_threshold: 4,
            ..CanningConfig::default()
        };
        let (count, back) = round_trip(&Object::Str("longer than four".to_string()), &config);
        assert_eq!(count, 2);
        assert_eq!(back, Object::Str("longer than four".to_string()));
    }

    #[test]
    fn test_missing_buffer_is_an_error() {
        let obj = Object::Buffer(Bytes::from_static(b"data"));
        let mut frames = serialize_object(&obj, &CanningConfig::default()).unwrap();
        frames.truncate(1);
        let mut queue: VecDeque<Bytes> = frames.into();
        assert!(matches!(
            unserialize_object(&mut queue),
            Err(CanningError::MissingBuffer)
        ));
    }

    #[test]
    fn test_garbage_description_is_an_error() {
        let mut queue: VecDeque<Bytes> = vec![Bytes::from_static(&[0xff, 0xff, 0xff])].into();
        assert!(unserialize_object(&mut queue).is_err());
    }

    #[test]
    fn test_leaves_trailing_frames() {
        let mut frames = serialize_object(&Object::Int(1), &CanningConfig::default()).unwrap();
        frames.extend(serialize_object(&Object::Int(2), &CanningConfig::default()).unwrap());
        let mut queue: VecDeque<Bytes> = frames.into();
        assert_eq!(unserialize_object(&mut queue).unwrap(), Object::Int(1));
        assert_eq!(unserialize_object(&mut queue).unwrap(), Object::Int(2));
    }
}
