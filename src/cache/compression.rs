//! L2 payload codecs.

use crate::{Error, Result};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

const DEFLATE_LEVEL: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    #[default]
    Lz4,
    Gzip,
    Zlib,
}

impl Compression {
    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Gzip => "gzip",
            Compression::Zlib => "zlib",
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let level = flate2::Compression::new(DEFLATE_LEVEL);
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Compression::Gzip => {
                let mut enc = GzEncoder::new(Vec::new(), level);
                enc.write_all(data).map_err(|e| self.error(e))?;
                enc.finish().map_err(|e| self.error(e))
            }
            Compression::Zlib => {
                let mut enc = ZlibEncoder::new(Vec::new(), level);
                enc.write_all(data).map_err(|e| self.error(e))?;
                enc.finish().map_err(|e| self.error(e))
            }
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Compression::None => return Ok(data.to_vec()),
            Compression::Lz4 => {
                return lz4_flex::decompress_size_prepended(data).map_err(|e| self.error(e))
            }
            Compression::Gzip => GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| self.error(e))?,
            Compression::Zlib => ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| self.error(e))?,
        };
        Ok(out)
    }

    fn error(&self, e: impl std::fmt::Display) -> Error {
        Error::Compression {
            codec: self.name().to_string(),
            message: e.to_string(),
        }
    }
}
