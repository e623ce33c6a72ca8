//! PX4 firmware descriptor format.
//!
//! A `.px4` file is a JSON envelope carrying metadata fields plus the
//! firmware itself as a zlib-compressed, base64-encoded blob:
//!
//! ```text
//! {
//!     "board_id": 9,
//!     "board_revision": 0,
//!     "image_size": 254360,
//!     "description": "...",        <- extra fields pass through
//!     "image": "eJzsvQl8VNX1..."
//! }
//! ```
//!
//! The decoded image is padded to a 4-byte boundary with `0xFF` (erased
//! flash) so it can be programmed and CRC'd in whole words.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::read::ZlibDecoder;
use log::debug;
use serde_json::{Map, Value};
use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};
use crate::protocol::crc::{CRC_PAD, crc32};

/// Metadata fields a descriptor must carry to be flashable.
const REQUIRED_FIELDS: [&str; 4] = ["image", "image_size", "board_id", "board_revision"];

/// A loaded firmware file: metadata plus the decoded image.
///
/// Constructed once per upload; the image is immutable after loading.
#[derive(Debug)]
pub struct Firmware {
    desc: Map<String, Value>,
    image: Vec<u8>,
}

impl Firmware {
    /// Load a firmware descriptor from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading firmware from: {}", path.display());
        let data = std::fs::read(path)?;
        Self::from_json(&data)
    }

    /// Parse a firmware descriptor from raw JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(data)
            .map_err(|e| Error::InvalidFirmware(format!("descriptor is not valid JSON: {e}")))?;
        let Value::Object(desc) = value else {
            return Err(Error::InvalidFirmware(
                "descriptor is not a JSON object".into(),
            ));
        };

        for field in REQUIRED_FIELDS {
            if !desc.contains_key(field) {
                return Err(Error::InvalidFirmware(format!(
                    "descriptor is missing required field `{field}`"
                )));
            }
        }

        let encoded = desc["image"]
            .as_str()
            .ok_or_else(|| Error::InvalidFirmware("`image` field is not a string".into()))?;
        let compressed = BASE64
            .decode(encoded)
            .map_err(|e| Error::Decode(format!("base64: {e}")))?;

        let mut image = Vec::new();
        ZlibDecoder::new(compressed.as_slice())
            .read_to_end(&mut image)
            .map_err(|e| Error::Decode(format!("zlib: {e}")))?;

        // Pad to a 4-byte boundary with erased-flash filler
        while image.len() % 4 != 0 {
            image.push(0xff);
        }

        debug!("Firmware image: {} bytes after padding", image.len());
        Ok(Self { desc, image })
    }

    /// The decoded, padded firmware image.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// All metadata fields, minus the image blob itself.
    ///
    /// Fields beyond the required ones pass through untouched.
    pub fn metadata(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.desc.iter().filter(|(k, _)| k.as_str() != "image")
    }

    /// Look up a metadata field.
    pub fn property(&self, name: &str) -> Result<&Value> {
        self.desc
            .get(name)
            .ok_or_else(|| Error::MissingField(name.to_string()))
    }

    /// Look up a metadata field that must be an unsigned integer.
    fn u32_property(&self, name: &str) -> Result<u32> {
        let value = self.property(name)?;
        value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| Error::InvalidFirmware(format!("`{name}` is not a 32-bit integer")))
    }

    /// Board identifier the image was built for.
    pub fn board_id(&self) -> Result<u32> {
        self.u32_property("board_id")
    }

    /// Board hardware revision (informational).
    pub fn board_revision(&self) -> Result<u32> {
        self.u32_property("board_revision")
    }

    /// Uncompressed image size the descriptor claims, in bytes.
    pub fn image_size(&self) -> Result<u32> {
        self.u32_property("image_size")
    }

    /// CRC of the image as the bootloader computes it over `padlen` bytes
    /// of flash.
    ///
    /// The image bytes are folded first, then virtual `0xFF` words until
    /// the running byte count reaches `padlen`: the device CRCs its whole
    /// application flash area, not just the programmed part. `padlen`
    /// values up to the image length add no padding.
    pub fn crc(&self, padlen: usize) -> u32 {
        let mut state = crc32(&self.image, 0);
        let mut count = self.image.len();
        while count < padlen {
            state = crc32(&CRC_PAD, state);
            count += 4;
        }
        state
    }
}
