//! Pluggable payload encoding layered over the session objects.
//!
//! [`Encoded`] pairs a [`Network`], [`Port`], [`Connection`] or [`Stream`]
//! with a [`PayloadCodec`]. Operations on an encoded object return encoded
//! objects, so the codec travels with the session down to its streams.
//! The inner object stays reachable through `Deref`.

use crate::error::WireResult;
use crate::frame::{FrameReadExt, FrameWriteExt};
use crate::network::Network;
use crate::port::{Connection, PendingConnection, Port};
use crate::stream::Stream;
use apphost_types::Identity;
use serde::de::{
    self, DeserializeOwned, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor,
};
use serde::{forward_to_deserialize_any, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::hash::Hash;
use std::io;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Turns values into payload text and back.
pub trait PayloadCodec: Clone + Send + Sync + Unpin + 'static {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> WireResult<String>;

    fn decode<T: DeserializeOwned>(&self, text: &str) -> WireResult<T>;

    /// Decode a list; blank text is an empty list.
    fn decode_list<T: DeserializeOwned>(&self, text: &str) -> WireResult<Vec<T>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.decode(text)
    }

    /// Decode a map; blank text is an empty map.
    fn decode_map<K, V>(&self, text: &str) -> WireResult<HashMap<K, V>>
    where
        K: DeserializeOwned + Eq + Hash,
        V: DeserializeOwned,
    {
        if text.trim().is_empty() {
            return Ok(HashMap::new());
        }
        self.decode(text)
    }
}

/// JSON payloads with lenient struct field names.
///
/// Peers written in other languages tend to send `camelCase` keys. On
/// decode, an object key that names no field of the target struct is
/// matched again in `snake_case`, so both spellings land on the same Rust
/// field. Map keys are data and pass through untouched. Encoding writes
/// serde's own field names.
#[derive(Debug, Clone, Copy)]
pub struct JsonCodec {
    normalize_keys: bool,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self {
            normalize_keys: true,
        }
    }
}

impl JsonCodec {
    /// A codec that requires exact field names.
    pub fn preserving() -> Self {
        Self {
            normalize_keys: false,
        }
    }
}

impl PayloadCodec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> WireResult<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, text: &str) -> WireResult<T> {
        let value: Value = serde_json::from_str(text)?;
        if self.normalize_keys {
            Ok(serde::Deserialize::deserialize(Lenient(value))?)
        } else {
            Ok(serde_json::from_value(value)?)
        }
    }
}

/// Deserializes a JSON value, renaming object keys only where the target
/// is a struct whose field list knows the `snake_case` spelling.
struct Lenient(Value);

impl<'de> Deserializer<'de> for Lenient {
    type Error = serde_json::Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Array(items) => visitor.visit_seq(LenientSeq(items.into_iter())),
            Value::Object(map) => visitor.visit_map(LenientMap::new(map.into_iter().collect())),
            other => other.deserialize_any(visitor),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Null => visitor.visit_none(),
            other => visitor.visit_some(Lenient(other)),
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Object(map) => {
                let entries = map
                    .into_iter()
                    .map(|(k, v)| (field_key(k, fields), v))
                    .collect();
                visitor.visit_map(LenientMap::new(entries))
            }
            other => Lenient(other).deserialize_any(visitor),
        }
    }

    // Enum payloads are decoded with exact field names.
    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.0.deserialize_enum(name, variants, visitor)
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct seq tuple tuple_struct map identifier
        ignored_any
    }
}

fn field_key(key: String, fields: &[&str]) -> String {
    if fields.contains(&key.as_str()) {
        return key;
    }
    let snake = to_snake_case(&key);
    if fields.contains(&snake.as_str()) {
        snake
    } else {
        key
    }
}

struct LenientSeq(std::vec::IntoIter<Value>);

impl<'de> SeqAccess<'de> for LenientSeq {
    type Error = serde_json::Error;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> Result<Option<T::Value>, Self::Error> {
        self.0.next().map(|v| seed.deserialize(Lenient(v))).transpose()
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.0.len())
    }
}

struct LenientMap {
    entries: std::vec::IntoIter<(String, Value)>,
    value: Option<Value>,
}

impl LenientMap {
    fn new(entries: Vec<(String, Value)>) -> Self {
        Self {
            entries: entries.into_iter(),
            value: None,
        }
    }
}

impl<'de> MapAccess<'de> for LenientMap {
    type Error = serde_json::Error;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> Result<Option<K::Value>, Self::Error> {
        match self.entries.next() {
            Some((key, value)) => {
                self.value = Some(value);
                seed.deserialize(MapKey(key)).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(
        &mut self,
        seed: V,
    ) -> Result<V::Value, Self::Error> {
        match self.value.take() {
            Some(value) => seed.deserialize(Lenient(value)),
            None => Err(de::Error::custom("map value requested before its key")),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}

/// A JSON object key. Integer targets parse the key text.
struct MapKey(String);

macro_rules! parse_key {
    ($($method:ident => $visit:ident),* $(,)?) => {$(
        fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
            match self.0.parse() {
                Ok(n) => visitor.$visit(n),
                Err(_) => visitor.visit_string(self.0),
            }
        }
    )*};
}

impl<'de> Deserializer<'de> for MapKey {
    type Error = serde_json::Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_string(self.0)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    parse_key! {
        deserialize_i8 => visit_i8,
        deserialize_i16 => visit_i16,
        deserialize_i32 => visit_i32,
        deserialize_i64 => visit_i64,
        deserialize_u8 => visit_u8,
        deserialize_u16 => visit_u16,
        deserialize_u32 => visit_u32,
        deserialize_u64 => visit_u64,
    }

    forward_to_deserialize_any! {
        bool i128 u128 f32 f64 char str string bytes byte_buf option unit
        unit_struct seq tuple tuple_struct map struct enum identifier ignored_any
    }
}

/// `fieldName`, `FieldName` and `field-name` all become `field_name`.
pub fn to_snake_case(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let mut out = String::with_capacity(key.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c == '-' || c == ' ' {
            out.push('_');
            continue;
        }
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// A session object paired with the codec its payloads use.
#[derive(Debug, Clone)]
pub struct Encoded<T, C = JsonCodec> {
    inner: T,
    codec: C,
}

impl<T, C: PayloadCodec> Encoded<T, C> {
    pub fn new(inner: T, codec: C) -> Self {
        Self { inner, codec }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn wrap<U>(&self, inner: U) -> Encoded<U, C> {
        Encoded::new(inner, self.codec.clone())
    }
}

impl<T, C> Deref for Encoded<T, C> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T, C> DerefMut for Encoded<T, C> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<C: PayloadCodec> Encoded<Network, C> {
    pub async fn register(&self, port: &str) -> WireResult<Encoded<Port, C>> {
        let port = self.inner.register(port).await?;
        Ok(self.wrap(port))
    }

    pub async fn query(&self, port: &str, identity: &Identity) -> WireResult<Encoded<Stream, C>> {
        let stream = self.inner.query(port, identity).await?;
        Ok(self.wrap(stream))
    }

    pub async fn query_name(&self, name: &str, port: &str) -> WireResult<Encoded<Stream, C>> {
        let stream = self.inner.query_name(name, port).await?;
        Ok(self.wrap(stream))
    }
}

impl<C: PayloadCodec> Encoded<Port, C> {
    pub async fn next(&self) -> WireResult<Encoded<PendingConnection, C>> {
        let pending = self.inner.next().await?;
        Ok(self.wrap(pending))
    }
}

impl<C: PayloadCodec> Encoded<PendingConnection, C> {
    pub async fn materialize(self) -> WireResult<Encoded<Connection, C>> {
        let Encoded { inner, codec } = self;
        let conn = inner.materialize().await?;
        Ok(Encoded::new(conn, codec))
    }
}

impl<C: PayloadCodec> Encoded<Connection, C> {
    pub async fn accept(self) -> WireResult<Encoded<Stream, C>> {
        let Encoded { inner, codec } = self;
        let stream = inner.accept().await?;
        Ok(Encoded::new(stream, codec))
    }

    pub async fn reject(self) -> WireResult<()> {
        self.inner.reject().await
    }
}

/// Typed payload helpers over any byte channel.
impl<S, C> Encoded<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: PayloadCodec,
{
    pub async fn write_encoded8<T: Serialize + ?Sized>(&mut self, value: &T) -> WireResult<()> {
        let text = self.codec.encode(value)?;
        self.inner.write_string8(&text).await
    }

    pub async fn write_encoded16<T: Serialize + ?Sized>(&mut self, value: &T) -> WireResult<()> {
        let text = self.codec.encode(value)?;
        self.inner.write_string16(&text).await
    }

    pub async fn write_encoded32<T: Serialize + ?Sized>(&mut self, value: &T) -> WireResult<()> {
        let text = self.codec.encode(value)?;
        self.inner.write_string32(&text).await
    }

    /// Write one encoded value terminated by a newline.
    pub async fn write_encoded_line<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> WireResult<()> {
        let text = self.codec.encode(value)?;
        self.inner.write_text_line(&text).await
    }

    /// Write one encoded value with no framing.
    pub async fn write_encoded_message<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> WireResult<()> {
        let text = self.codec.encode(value)?;
        tokio::io::AsyncWriteExt::write_all(&mut self.inner, text.as_bytes()).await?;
        Ok(())
    }

    pub async fn read_decoded8<T: DeserializeOwned>(&mut self) -> WireResult<T> {
        let text = self.inner.read_string8().await?;
        self.codec.decode(&text)
    }

    pub async fn read_decoded16<T: DeserializeOwned>(&mut self) -> WireResult<T> {
        let text = self.inner.read_string16().await?;
        self.codec.decode(&text)
    }

    pub async fn read_decoded32<T: DeserializeOwned>(&mut self) -> WireResult<T> {
        let text = self.inner.read_string32().await?;
        self.codec.decode(&text)
    }

    /// Read one newline-terminated value; `None` at end of stream.
    pub async fn read_decoded_line<T: DeserializeOwned>(&mut self) -> WireResult<Option<T>> {
        match self.inner.read_text_line().await? {
            Some(text) => self.codec.decode(&text).map(Some),
            None => Ok(None),
        }
    }

    /// Read one unframed value; `None` at end of stream or for `null`.
    pub async fn read_decoded_message<T: DeserializeOwned>(&mut self) -> WireResult<Option<T>> {
        match self.inner.read_message().await? {
            Some(text) => self.codec.decode(&text).map(Some),
            None => Ok(None),
        }
    }

    /// Read one unframed list; end of stream and blank text are empty.
    pub async fn read_decoded_list<T: DeserializeOwned>(&mut self) -> WireResult<Vec<T>> {
        match self.inner.read_message().await? {
            Some(text) => self.codec.decode_list(&text),
            None => Ok(Vec::new()),
        }
    }
}

impl<S: AsyncRead + Unpin, C: Unpin> AsyncRead for Encoded<S, C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin, C: Unpin> AsyncWrite for Encoded<S, C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
