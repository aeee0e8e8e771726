//! value codecs sitting between feed blocks and user values
//!
//! A feed stores opaque bytes; the codec decides what a block means to the
//! caller. The codec is fixed at feed construction, so the choice is a type
//! parameter rather than a runtime string.
use crate::error::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;

pub trait Codec: Clone {
    type Value;
    const NAME: &'static str;

    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>>;
    fn decode(&self, data: &[u8]) -> Result<Self::Value>;
}

/// raw bytes in, raw bytes out
#[derive(Debug, Clone, Copy, Default)]
pub struct Binary;

impl Codec for Binary {
    type Value = Vec<u8>;
    const NAME: &'static str = "binary";

    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8;

impl Codec for Utf8 {
    type Value = String;
    const NAME: &'static str = "utf-8";

    fn encode(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<String> {
        Ok(String::from_utf8(data.to_vec())?)
    }
}

/// Newline-delimited JSON.
///
/// Each block carries one JSON document followed by `\n`, so the raw data
/// stream doubles as a line-parseable file.
#[derive(Debug)]
pub struct Json<T>(PhantomData<T>);

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Clone for Json<T> {
    fn clone(&self) -> Self {
        Self(PhantomData)
    }
}

impl<T: Serialize + DeserializeOwned> Codec for Json<T> {
    type Value = T;
    const NAME: &'static str = "json";

    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        let mut data = serde_json::to_vec(value)?;
        data.push(b'\n');
        Ok(data)
    }

    fn decode(&self, data: &[u8]) -> Result<T> {
        let data = data.strip_suffix(b"\n").unwrap_or(data);
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_is_identity() {
        let codec = Binary;
        let data = vec![0u8, 1, 2, 255];
        assert_eq!(codec.decode(&codec.encode(&data).unwrap()).unwrap(), data);
    }

    #[test]
    fn utf8_round_trips_and_rejects_garbage() {
        let codec = Utf8;
        let value = "grüße".to_string();
        assert_eq!(codec.decode(&codec.encode(&value).unwrap()).unwrap(), value);
        assert!(codec.decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn json_blocks_are_newline_framed() {
        let codec = Json::<Vec<u32>>::default();
        let encoded = codec.encode(&vec![1, 2, 3]).unwrap();
        assert_eq!(encoded, b"[1,2,3]\n");
        assert_eq!(codec.decode(&encoded).unwrap(), vec![1, 2, 3]);
        // tolerate a missing trailing newline
        assert_eq!(codec.decode(b"[4]").unwrap(), vec![4]);
    }
}
