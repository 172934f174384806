use std::io::{Read, Write};
use std::str::FromStr;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::StoreError;
use crate::metrics::MetricSet;

/// How a metric set is laid out in the `payload` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadEncoding {
    Json,
    ZlibJson,
}

impl PayloadEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadEncoding::Json => "json",
            PayloadEncoding::ZlibJson => "zlib-json",
        }
    }
}

impl FromStr for PayloadEncoding {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(PayloadEncoding::Json),
            "zlib-json" => Ok(PayloadEncoding::ZlibJson),
            other => Err(StoreError::Corruption(format!(
                "unknown payload encoding '{}'",
                other
            ))),
        }
    }
}

pub(crate) fn encode(metrics: &MetricSet, encoding: PayloadEncoding) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(metrics).map_err(|e| StoreError::Encode(e.to_string()))?;
    match encoding {
        PayloadEncoding::Json => Ok(json),
        PayloadEncoding::ZlibJson => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
            encoder.write_all(&json)?;
            Ok(encoder.finish()?)
        }
    }
}

pub(crate) fn decode(bytes: &[u8], encoding: PayloadEncoding) -> Result<MetricSet, StoreError> {
    let json = match encoding {
        PayloadEncoding::Json => bytes.to_vec(),
        PayloadEncoding::ZlibJson => {
            let mut out = Vec::new();
            ZlibDecoder::new(bytes)
                .read_to_end(&mut out)
                .map_err(|e| StoreError::Corruption(format!("payload inflate failed: {}", e)))?;
            out
        }
    };
    serde_json::from_slice(&json)
        .map_err(|e| StoreError::Corruption(format!("payload is not a metric set: {}", e)))
}
