// Texture decoding into tightly packed RGBA8

use anyhow::{ensure, Context, Result};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    /// RGBA8, row-major, no padding
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn load(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("Failed to decode texture {:?}", path))?
            .to_rgba8();

        log::info!("Loaded texture {:?} ({}x{})", path, image.width(), image.height());
        Ok(Self {
            width: image.width(),
            height: image.height(),
            pixels: image.into_raw(),
        })
    }

    /// Decode an encoded image (PNG, JPEG) held in memory
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes)
            .context("Failed to decode texture bytes")?
            .to_rgba8();

        Ok(Self {
            width: image.width(),
            height: image.height(),
            pixels: image.into_raw(),
        })
    }

    /// Load the texture at `path`, or fall back to a checkerboard when it is missing
    pub fn load_or_checkerboard(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            log::warn!("Texture {:?} not found, using a checkerboard", path);
            Ok(Self::checkerboard(256, 8))
        }
    }

    /// `size` x `size` pixels of `cells` x `cells` alternating squares
    pub fn checkerboard(size: u32, cells: u32) -> Self {
        let cell = (size / cells.max(1)).max(1);
        let pixels = (0..size)
            .flat_map(|y| (0..size).map(move |x| (x, y)))
            .flat_map(|(x, y)| {
                if (x / cell + y / cell) % 2 == 0 {
                    [235, 235, 235, 255]
                } else {
                    [40, 40, 40, 255]
                }
            })
            .collect();

        Self {
            width: size,
            height: size,
            pixels,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.width > 0 && self.height > 0, "Texture has no pixels");
        let expected = (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|texels| texels.checked_mul(4))
            .with_context(|| format!("Texture size {}x{} overflows", self.width, self.height))?;
        ensure!(
            self.pixels.len() == expected,
            "Texture is {}x{} but holds {} bytes",
            self.width,
            self.height,
            self.pixels.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    #[test]
    fn decodes_png_to_rgba8() {
        let mut source = RgbaImage::new(3, 2);
        source.put_pixel(2, 1, Rgba([10, 20, 30, 40]));
        let mut encoded = Cursor::new(Vec::new());
        source.write_to(&mut encoded, ImageFormat::Png).unwrap();

        let texture = TextureData::from_bytes(encoded.get_ref()).unwrap();

        assert_eq!((texture.width, texture.height), (3, 2));
        assert_eq!(texture.pixels.len(), 3 * 2 * 4);
        // Last pixel of the second row
        assert_eq!(&texture.pixels[20..24], &[10, 20, 30, 40]);
        texture.validate().unwrap();
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(TextureData::from_bytes(b"definitely not an image").is_err());
    }

    #[test]
    fn checkerboard_alternates_cells() {
        let texture = TextureData::checkerboard(4, 2);
        texture.validate().unwrap();

        let pixel = |x: usize, y: usize| texture.pixels[(y * 4 + x) * 4];
        assert_eq!(pixel(0, 0), pixel(1, 1));
        assert_ne!(pixel(0, 0), pixel(2, 0));
        assert_ne!(pixel(0, 0), pixel(0, 2));
        assert_eq!(pixel(0, 0), pixel(3, 3));
    }

    #[test]
    fn size_mismatch_fails_validation() {
        let texture = TextureData {
            width: 2,
            height: 2,
            pixels: vec![0; 4],
        };
        assert!(texture.validate().is_err());
    }

    #[test]
    fn huge_dimensions_fail_validation_without_panicking() {
        let texture = TextureData {
            width: 70_000,
            height: 70_000,
            pixels: Vec::new(),
        };
        assert!(texture.validate().is_err());

        let texture = TextureData {
            width: u32::MAX,
            height: u32::MAX,
            pixels: Vec::new(),
        };
        assert!(texture.validate().is_err());
    }
}
