//! Snapshot payload checks.
//!
//! Only the JPEG signature is inspected; nothing here decodes pixels.

/// Payloads shorter than this are error pages or truncated frames.
pub const MIN_IMAGE_BYTES: usize = 1000;

const JPEG_SIGNATURE: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// True if `data` is long enough and starts with the JPEG SOI marker.
pub fn is_valid_image(data: &[u8]) -> bool {
    data.len() >= MIN_IMAGE_BYTES && data.starts_with(&JPEG_SIGNATURE)
}

/// Coarse resolution bucket guessed from the payload size.
pub fn estimate_resolution(data: &[u8]) -> &'static str {
    let kib = data.len() / 1024;
    if kib > 2000 {
        "1920x1080"
    } else if kib > 1000 {
        "1280x720"
    } else if kib > 500 {
        "640x480"
    } else {
        "Unknown"
    }
}
