use crate::error::{Result, WarehouseError};
use encoding_rs::Encoding;
use std::path::Path;
use tracing::{debug, warn};

/// Decode raw file bytes, trying each encoding label in order.
///
/// A leading byte order mark is honoured before any fallback is tried.
pub fn decode_text(source: &Path, bytes: &[u8], encodings: &[String]) -> Result<String> {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(&bytes[bom_len..]) {
            return Ok(text.into_owned());
        }
    }

    for (attempt, label) in encodings.iter().enumerate() {
        let encoding = Encoding::for_label(label.as_bytes()).ok_or_else(|| {
            WarehouseError::Config(format!("Unknown encoding: {}", label))
        })?;
        match encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            Some(text) => {
                if attempt > 0 {
                    warn!("{} decoded with fallback encoding {}", source.display(), encoding.name());
                } else {
                    debug!("{} decoded as {}", source.display(), encoding.name());
                }
                return Ok(text.into_owned());
            }
            None => continue,
        }
    }

    Err(WarehouseError::input_format(
        source,
        format!("content is not valid in any of: {}", encodings.join(", ")),
    ))
}

/// Read a file and decode it.
pub fn read_text(source: &Path, encodings: &[String]) -> Result<String> {
    let bytes = std::fs::read(source)?;
    decode_text(source, &bytes, encodings)
}
