//! # Packet Schema Registry
//!
//! The session engine does not know the game's packet set. Generated schema
//! code hands it, per packet id, a pair of closures that turn a body into
//! [`Fields`] and back. The registry stores those closures behind an
//! `Arc<RwLock<..>>` so it can be shared by every session worker and extended
//! at startup.
//!
//! Two ways to register a packet:
//! - [`PacketRegistry::register_fn`] with hand-written closures
//! - [`PacketRegistry::register_schema`] with a declarative field list, which
//!   is interpreted by [`FieldKind`]
//!
//! ```rust
//! use blocknet::core::schema::{FieldKind, FieldValue, PacketRegistry};
//!
//! let registry = PacketRegistry::new();
//! registry
//!     .register_schema(0x90, "Text", vec![FieldKind::String, FieldKind::Bool])
//!     .unwrap();
//!
//! let fields = vec![FieldValue::String("hi".into()), FieldValue::Bool(false)];
//! let body = registry.encode(0x90, &fields).unwrap();
//! assert_eq!(registry.decode(0x90, &body).unwrap(), fields);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::core::binary::{PacketReader, PacketWriter};
use crate::core::packet::is_builtin_id;
use crate::error::{constants, ProtocolError, Result};

/// Decoded field values of one game packet, in schema order
pub type Fields = Vec<FieldValue>;

type DecodeFn = dyn Fn(&mut PacketReader<'_>) -> Result<Fields> + Send + Sync + 'static;
type EncodeFn = dyn Fn(&Fields, &mut PacketWriter) -> Result<()> + Send + Sync + 'static;

/// Dynamically typed field value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    U8(u8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    VarU32(u32),
    VarI32(i32),
    VarU64(u64),
    VarI64(i64),
    String(String),
    Blob(Bytes),
    Uuid([u8; 16]),
    Optional(Option<Box<FieldValue>>),
    List(Vec<FieldValue>),
    Record(Vec<FieldValue>),
}

/// Wire type of one schema field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Bool,
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
    VarU32,
    VarI32,
    VarU64,
    VarI64,
    String,
    Blob,
    Uuid,
    /// bool presence flag followed by the value
    Optional(Box<FieldKind>),
    /// var-u32 element count followed by the elements
    List(Box<FieldKind>),
    /// fields laid out back to back
    Record(Vec<FieldKind>),
}

/// Upper bound on list lengths accepted while decoding
const MAX_LIST_LEN: usize = 65_536;

impl FieldKind {
    pub fn decode(&self, r: &mut PacketReader<'_>) -> Result<FieldValue> {
        Ok(match self {
            FieldKind::Bool => FieldValue::Bool(r.read_bool()?),
            FieldKind::U8 => FieldValue::U8(r.read_u8()?),
            FieldKind::I16 => FieldValue::I16(r.read_i16()?),
            FieldKind::I32 => FieldValue::I32(r.read_i32()?),
            FieldKind::I64 => FieldValue::I64(r.read_i64()?),
            FieldKind::F32 => FieldValue::F32(r.read_f32()?),
            FieldKind::F64 => FieldValue::F64(r.read_f64()?),
            FieldKind::VarU32 => FieldValue::VarU32(r.read_var_u32()?),
            FieldKind::VarI32 => FieldValue::VarI32(r.read_var_i32()?),
            FieldKind::VarU64 => FieldValue::VarU64(r.read_var_u64()?),
            FieldKind::VarI64 => FieldValue::VarI64(r.read_var_i64()?),
            FieldKind::String => FieldValue::String(r.read_string()?),
            FieldKind::Blob => FieldValue::Blob(Bytes::copy_from_slice(r.read_blob()?)),
            FieldKind::Uuid => FieldValue::Uuid(r.read_array::<16>()?),
            FieldKind::Optional(inner) => {
                if r.read_bool()? {
                    FieldValue::Optional(Some(Box::new(inner.decode(r)?)))
                } else {
                    FieldValue::Optional(None)
                }
            }
            FieldKind::List(inner) => {
                let len = r.read_var_u32()? as usize;
                // every element takes at least one byte
                if len > MAX_LIST_LEN || len > r.remaining() {
                    return Err(ProtocolError::malformed(constants::ERR_LENGTH_PREFIX));
                }
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(inner.decode(r)?);
                }
                FieldValue::List(items)
            }
            FieldKind::Record(kinds) => {
                let mut items = Vec::with_capacity(kinds.len());
                for kind in kinds {
                    items.push(kind.decode(r)?);
                }
                FieldValue::Record(items)
            }
        })
    }

    pub fn encode(&self, value: &FieldValue, w: &mut PacketWriter) -> Result<()> {
        match (self, value) {
            (FieldKind::Bool, FieldValue::Bool(v)) => w.write_bool(*v),
            (FieldKind::U8, FieldValue::U8(v)) => w.write_u8(*v),
            (FieldKind::I16, FieldValue::I16(v)) => w.write_i16(*v),
            (FieldKind::I32, FieldValue::I32(v)) => w.write_i32(*v),
            (FieldKind::I64, FieldValue::I64(v)) => w.write_i64(*v),
            (FieldKind::F32, FieldValue::F32(v)) => w.write_f32(*v),
            (FieldKind::F64, FieldValue::F64(v)) => w.write_f64(*v),
            (FieldKind::VarU32, FieldValue::VarU32(v)) => w.write_var_u32(*v),
            (FieldKind::VarI32, FieldValue::VarI32(v)) => w.write_var_i32(*v),
            (FieldKind::VarU64, FieldValue::VarU64(v)) => w.write_var_u64(*v),
            (FieldKind::VarI64, FieldValue::VarI64(v)) => w.write_var_i64(*v),
            (FieldKind::String, FieldValue::String(v)) => w.write_string(v)?,
            (FieldKind::Blob, FieldValue::Blob(v)) => w.write_blob(v)?,
            (FieldKind::Uuid, FieldValue::Uuid(v)) => w.write_array(v),
            (FieldKind::Optional(inner), FieldValue::Optional(v)) => match v {
                Some(v) => {
                    w.write_bool(true);
                    inner.encode(v, w)?;
                }
                None => w.write_bool(false),
            },
            (FieldKind::List(inner), FieldValue::List(items)) => {
                let len = u32::try_from(items.len())
                    .map_err(|_| ProtocolError::SchemaError("list too long".into()))?;
                w.write_var_u32(len);
                for item in items {
                    inner.encode(item, w)?;
                }
            }
            (FieldKind::Record(kinds), FieldValue::Record(items)) => encode_all(kinds, items, w)?,
            (kind, value) => {
                return Err(ProtocolError::SchemaError(format!(
                    "value {value:?} does not match field kind {kind:?}"
                )))
            }
        }
        Ok(())
    }
}

fn encode_all(kinds: &[FieldKind], values: &[FieldValue], w: &mut PacketWriter) -> Result<()> {
    if kinds.len() != values.len() {
        return Err(ProtocolError::SchemaError(format!(
            "expected {} fields, got {}",
            kinds.len(),
            values.len()
        )));
    }
    for (kind, value) in kinds.iter().zip(values) {
        kind.encode(value, w)?;
    }
    Ok(())
}

struct PacketSchema {
    name: Arc<str>,
    decode: Box<DecodeFn>,
    encode: Box<EncodeFn>,
}

/// Shared mapping from game packet id to its codec closures
#[derive(Clone, Default)]
pub struct PacketRegistry {
    schemas: Arc<RwLock<HashMap<u32, PacketSchema>>>,
}

impl std::fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.schemas.read().map(|s| s.len()).unwrap_or_default();
        f.debug_struct("PacketRegistry")
            .field("packets", &count)
            .finish()
    }
}

impl PacketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register raw decode/encode closures for `id`
    pub fn register_fn<D, E>(&self, id: u32, name: &str, decode: D, encode: E) -> Result<()>
    where
        D: Fn(&mut PacketReader<'_>) -> Result<Fields> + Send + Sync + 'static,
        E: Fn(&Fields, &mut PacketWriter) -> Result<()> + Send + Sync + 'static,
    {
        if is_builtin_id(id) {
            return Err(ProtocolError::SchemaError(format!(
                "packet id 0x{id:02x} is reserved for session packets"
            )));
        }

        let mut schemas = self
            .schemas
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_SCHEMA_LOCK.into()))?;
        schemas.insert(
            id,
            PacketSchema {
                name: Arc::from(name),
                decode: Box::new(decode),
                encode: Box::new(encode),
            },
        );
        Ok(())
    }

    /// Register a packet described by a flat list of field kinds
    pub fn register_schema(&self, id: u32, name: &str, fields: Vec<FieldKind>) -> Result<()> {
        let fields = Arc::new(fields);
        let decode_fields = Arc::clone(&fields);
        self.register_fn(
            id,
            name,
            move |r| {
                decode_fields
                    .iter()
                    .map(|kind| kind.decode(r))
                    .collect::<Result<Fields>>()
            },
            move |values, w| encode_all(&fields, values, w),
        )
    }

    pub fn contains(&self, id: u32) -> bool {
        self.schemas
            .read()
            .map(|s| s.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn name(&self, id: u32) -> Option<Arc<str>> {
        self.schemas
            .read()
            .ok()
            .and_then(|s| s.get(&id).map(|schema| Arc::clone(&schema.name)))
    }

    /// Decode a full body; the schema must consume every byte
    pub fn decode(&self, id: u32, body: &[u8]) -> Result<Fields> {
        let schemas = self
            .schemas
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_SCHEMA_LOCK.into()))?;
        let schema = schemas.get(&id).ok_or_else(|| {
            ProtocolError::MalformedPacket(format!("{} 0x{id:02x}", constants::ERR_UNKNOWN_PACKET))
        })?;

        let mut reader = PacketReader::new(body);
        let fields = (schema.decode)(&mut reader)?;
        reader.finish()?;
        Ok(fields)
    }

    pub fn encode(&self, id: u32, fields: &Fields) -> Result<Bytes> {
        let schemas = self
            .schemas
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_SCHEMA_LOCK.into()))?;
        let schema = schemas.get(&id).ok_or_else(|| {
            ProtocolError::SchemaError(format!("no schema registered for 0x{id:02x}"))
        })?;

        let mut writer = PacketWriter::new();
        (schema.encode)(fields, &mut writer)?;
        Ok(writer.freeze())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn move_player_schema() -> Vec<FieldKind> {
        vec![
            FieldKind::VarU64,
            FieldKind::Record(vec![FieldKind::F32, FieldKind::F32, FieldKind::F32]),
            FieldKind::Optional(Box::new(FieldKind::String)),
            FieldKind::List(Box::new(FieldKind::VarI32)),
        ]
    }

    #[test]
    fn test_schema_roundtrip() {
        let registry = PacketRegistry::new();
        registry
            .register_schema(0x13, "MovePlayer", move_player_schema())
            .unwrap();

        let fields = vec![
            FieldValue::VarU64(42),
            FieldValue::Record(vec![
                FieldValue::F32(1.0),
                FieldValue::F32(64.5),
                FieldValue::F32(-3.25),
            ]),
            FieldValue::Optional(Some(Box::new(FieldValue::String("steve".into())))),
            FieldValue::List(vec![FieldValue::VarI32(-1), FieldValue::VarI32(9)]),
        ];
        let body = registry.encode(0x13, &fields).unwrap();
        assert_eq!(registry.decode(0x13, &body).unwrap(), fields);
        assert_eq!(registry.name(0x13).as_deref(), Some("MovePlayer"));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let registry = PacketRegistry::new();
        registry
            .register_schema(0x20, "Tiny", vec![FieldKind::U8])
            .unwrap();
        let err = registry.decode(0x20, &[1, 2]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPacket(_)));
    }

    #[test]
    fn test_unknown_id_is_malformed() {
        let registry = PacketRegistry::new();
        assert!(matches!(
            registry.decode(0x77, &[]),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_builtin_ids_reserved() {
        let registry = PacketRegistry::new();
        assert!(registry
            .register_schema(0x01, "Hijack", vec![FieldKind::U8])
            .is_err());
    }

    #[test]
    fn test_mismatched_value_rejected_on_encode() {
        let registry = PacketRegistry::new();
        registry
            .register_schema(0x21, "Flag", vec![FieldKind::Bool])
            .unwrap();
        assert!(registry.encode(0x21, &vec![FieldValue::U8(1)]).is_err());
        assert!(registry.encode(0x21, &vec![]).is_err());
    }

    #[test]
    fn test_list_length_bounded_by_buffer() {
        let registry = PacketRegistry::new();
        registry
            .register_schema(0x22, "Ids", vec![FieldKind::List(Box::new(FieldKind::U8))])
            .unwrap();
        // claims 200 elements with 1 byte of data
        let err = registry.decode(0x22, &[0xC8, 0x01, 0x05]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPacket(_)));
    }

    #[test]
    fn test_custom_closures() {
        let registry = PacketRegistry::new();
        registry
            .register_fn(
                0x30,
                "Raw",
                |r| Ok(vec![FieldValue::Blob(Bytes::copy_from_slice(r.read_rest()))]),
                |fields, w| match fields.as_slice() {
                    [FieldValue::Blob(b)] => {
                        w.write_array(b);
                        Ok(())
                    }
                    _ => Err(ProtocolError::SchemaError("expected one blob".into())),
                },
            )
            .unwrap();
        let fields = vec![FieldValue::Blob(Bytes::from_static(b"chunk"))];
        let body = registry.encode(0x30, &fields).unwrap();
        assert_eq!(&body[..], b"chunk");
        assert_eq!(registry.decode(0x30, &body).unwrap(), fields);
    }
}
