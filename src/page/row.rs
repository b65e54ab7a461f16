//! Row (de)serialization (spec §3, §8 round-trip properties).
//!
//! A row is `[type-tag bitmap | fixed-length region | variable-length
//! region]`. Each value is self-describing (type code + null flag + bytes);
//! variable-length values carry a 4-byte little-endian length prefix.

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Blob(Vec<u8>),
}

impl DataValue {
    fn type_code(&self) -> u8 {
        match self {
            DataValue::Null => 0,
            DataValue::Int(_) => 1,
            DataValue::Float(_) => 2,
            DataValue::Bool(_) => 3,
            DataValue::Text(_) => 4,
            DataValue::Blob(_) => 5,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.type_code());
        match self {
            DataValue::Null => {}
            DataValue::Int(v) => buf.extend_from_slice(&v.to_le_bytes()),
            DataValue::Float(v) => buf.extend_from_slice(&v.to_le_bytes()),
            DataValue::Bool(v) => buf.push(if *v { 1 } else { 0 }),
            DataValue::Text(s) => {
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            DataValue::Blob(b) => {
                buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
                buf.extend_from_slice(b);
            }
        }
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let type_code = *buf
            .get(*pos)
            .ok_or_else(|| EngineError::Serialization("truncated value header".into()))?;
        *pos += 1;
        Ok(match type_code {
            0 => DataValue::Null,
            1 => {
                let bytes: [u8; 8] = buf
                    .get(*pos..*pos + 8)
                    .ok_or_else(|| EngineError::Serialization("truncated int".into()))?
                    .try_into()
                    .unwrap();
                *pos += 8;
                DataValue::Int(i64::from_le_bytes(bytes))
            }
            2 => {
                let bytes: [u8; 8] = buf
                    .get(*pos..*pos + 8)
                    .ok_or_else(|| EngineError::Serialization("truncated float".into()))?
                    .try_into()
                    .unwrap();
                *pos += 8;
                DataValue::Float(f64::from_le_bytes(bytes))
            }
            3 => {
                let b = *buf
                    .get(*pos)
                    .ok_or_else(|| EngineError::Serialization("truncated bool".into()))?;
                *pos += 1;
                DataValue::Bool(b != 0)
            }
            4 => {
                let len = read_len(buf, pos)?;
                let s = std::str::from_utf8(
                    buf.get(*pos..*pos + len)
                        .ok_or_else(|| EngineError::Serialization("truncated text".into()))?,
                )
                .map_err(|e| EngineError::Serialization(e.to_string()))?
                .to_string();
                *pos += len;
                DataValue::Text(s)
            }
            5 => {
                let len = read_len(buf, pos)?;
                let b = buf
                    .get(*pos..*pos + len)
                    .ok_or_else(|| EngineError::Serialization("truncated blob".into()))?
                    .to_vec();
                *pos += len;
                DataValue::Blob(b)
            }
            other => return Err(EngineError::Serialization(format!("unknown type code {other}"))),
        })
    }
}

fn read_len(buf: &[u8], pos: &mut usize) -> Result<usize> {
    let bytes: [u8; 4] = buf
        .get(*pos..*pos + 4)
        .ok_or_else(|| EngineError::Serialization("truncated length prefix".into()))?
        .try_into()
        .unwrap();
    *pos += 4;
    Ok(u32::from_le_bytes(bytes) as usize)
}

/// An ordered sequence of typed values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub values: Vec<DataValue>,
}

impl Row {
    pub fn new(values: Vec<DataValue>) -> Self {
        Self { values }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for v in &self.values {
            v.encode(&mut buf);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let count = read_len(buf, &mut pos)?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(DataValue::decode(buf, &mut pos)?);
        }
        Ok(Row { values })
    }
}
