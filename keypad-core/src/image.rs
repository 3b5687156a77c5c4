//! Raster images moved between nodes: row-major, 16 bits per pixel.

use bytes::Bytes;

/// Bytes per pixel (packed 16-bit color).
pub const BYTES_PER_PIXEL: usize = 2;

/// Number of bytes in a `width` x `height` image.
pub fn image_len(width: u16, height: u16) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}

/// Immutable rendered image. Replaced as a whole on each render, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    width: u16,
    height: u16,
    pixels: Bytes,
}

impl Image {
    pub fn new(width: u16, height: u16, pixels: impl Into<Bytes>) -> Result<Self, ImageError> {
        let pixels = pixels.into();
        let expected = image_len(width, height);
        if pixels.len() != expected {
            return Err(ImageError::LengthMismatch {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("pixel buffer is {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Where and what to pull, as advertised by an ImageReady message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTicket {
    pub host: String,
    pub port: u16,
    pub width: u16,
    pub height: u16,
}

impl ImageTicket {
    pub fn byte_len(&self) -> usize {
        image_len(self.width, self.height)
    }

    /// Zero-sized announcements are abandoned before any socket is opened.
    pub fn is_pullable(&self) -> bool {
        self.width > 0 && self.height > 0 && !self.host.is_empty() && self.port != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_length_checked() {
        assert!(Image::new(64, 64, vec![0u8; 64 * 64 * 2]).is_ok());
        let err = Image::new(64, 64, vec![0u8; 10]).unwrap_err();
        assert!(matches!(
            err,
            ImageError::LengthMismatch {
                expected: 8192,
                actual: 10
            }
        ));
    }

    #[test]
    fn ticket_pullable() {
        let t = ImageTicket {
            host: "10.0.0.2".into(),
            port: 23457,
            width: 64,
            height: 64,
        };
        assert!(t.is_pullable());
        assert_eq!(t.byte_len(), 8192);
        assert!(!ImageTicket { width: 0, ..t.clone() }.is_pullable());
        assert!(!ImageTicket { port: 0, ..t }.is_pullable());
    }
}
