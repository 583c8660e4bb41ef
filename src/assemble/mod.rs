//! Assembly of retrieved page images into a single PDF.
//!
//! One PDF page per image, sized to the image's native pixel
//! dimensions. JPEG bytes are embedded verbatim as `DCTDecode` image
//! XObjects; PNGs are decoded and embedded as raw samples (flate
//! compression is applied document-wide on save). No scaling, cropping
//! or visual re-encoding.

use anyhow::{Context, Result};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use tracing::debug;

/// Turns an ordered list of page images into one output document.
pub trait DocumentAssembler: Send + Sync {
    fn assemble(&self, images: &[Vec<u8>]) -> Result<Vec<u8>>;
}

/// PDF assembler backed by lopdf.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfAssembler;

impl DocumentAssembler for PdfAssembler {
    fn assemble(&self, images: &[Vec<u8>]) -> Result<Vec<u8>> {
        if images.is_empty() {
            anyhow::bail!("No images to assemble");
        }

        let mut doc = Document::with_version("1.5");
        let mut page_ids = Vec::with_capacity(images.len());

        for (index, bytes) in images.iter().enumerate() {
            let (xobject, width, height) = image_xobject(bytes)
                .with_context(|| format!("Failed to embed page image {}", index + 1))?;
            let image_id = doc.add_object(xobject);

            // Paint the image across the full page.
            let content = Content {
                operations: vec![
                    Operation::new("q", vec![]),
                    Operation::new(
                        "cm",
                        vec![
                            (width as i64).into(),
                            0.into(),
                            0.into(),
                            (height as i64).into(),
                            0.into(),
                            0.into(),
                        ],
                    ),
                    Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
                    Operation::new("Q", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(
                dictionary! {},
                content.encode().context("Failed to encode page content")?,
            ));

            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "MediaBox" => vec![
                    0.into(),
                    0.into(),
                    (width as i64).into(),
                    (height as i64).into(),
                ],
                "Resources" => dictionary! {
                    "XObject" => dictionary! {
                        "Im0" => image_id,
                    },
                },
                "Contents" => content_id,
            });
            page_ids.push(page_id);
        }

        let kids: Vec<Object> = page_ids.iter().map(|&id| id.into()).collect();
        let pages_id = doc.add_object(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_ids.len() as i64,
        });

        for &page_id in &page_ids {
            if let Ok(Object::Dictionary(dict)) = doc.get_object_mut(page_id) {
                dict.set("Parent", pages_id);
            }
        }

        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        // Flate-compresses content streams and raw samples; DCTDecode
        // streams opted out above.
        doc.compress();

        let mut buffer = Vec::new();
        doc.save_to(&mut buffer).context("Failed to write PDF")?;
        debug!(
            "Assembled {} pages into {} bytes of PDF",
            images.len(),
            buffer.len()
        );
        Ok(buffer)
    }
}

/// Build the image XObject stream for one page, returning it with the
/// image's pixel dimensions.
fn image_xobject(bytes: &[u8]) -> Result<(Stream, u32, u32)> {
    match infer::get(bytes).map(|t| t.mime_type()) {
        Some("image/jpeg") => jpeg_xobject(bytes),
        Some("image/png") => png_xobject(bytes),
        other => anyhow::bail!("Unsupported page image format: {:?}", other),
    }
}

/// Embed JPEG bytes untouched; the PDF reader applies DCTDecode.
fn jpeg_xobject(bytes: &[u8]) -> Result<(Stream, u32, u32)> {
    // Decode only to learn dimensions and colour layout.
    let decoded = image::load_from_memory(bytes).context("Failed to decode JPEG")?;
    let (width, height) = (decoded.width(), decoded.height());
    let colorspace = if decoded.color().has_color() {
        "DeviceRGB"
    } else {
        "DeviceGray"
    };

    let stream = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => colorspace,
            "BitsPerComponent" => 8,
            "Filter" => "DCTDecode",
        },
        bytes.to_vec(),
    )
    .with_compression(false);

    Ok((stream, width, height))
}

/// Decode a PNG and embed its raw samples.
fn png_xobject(bytes: &[u8]) -> Result<(Stream, u32, u32)> {
    let decoded = image::load_from_memory(bytes).context("Failed to decode PNG")?;
    let (width, height) = (decoded.width(), decoded.height());

    let (colorspace, samples) = if decoded.color().has_color() {
        ("DeviceRGB", decoded.to_rgb8().into_raw())
    } else {
        ("DeviceGray", decoded.to_luma8().into_raw())
    };

    let stream = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => colorspace,
            "BitsPerComponent" => 8,
        },
        samples,
    );

    Ok((stream, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn encoded_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut buffer = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buffer, format)
            .unwrap();
        buffer.into_inner()
    }

    #[test]
    fn one_pdf_page_per_image() {
        let images = vec![
            encoded_image(40, 30, ImageFormat::Jpeg),
            encoded_image(20, 60, ImageFormat::Png),
            encoded_image(8, 8, ImageFormat::Jpeg),
        ];
        let pdf = PdfAssembler.assemble(&images).unwrap();

        let doc = Document::load_mem(&pdf).unwrap();
        assert_eq!(doc.get_pages().len(), 3);
    }

    #[test]
    fn page_size_matches_image_pixels() {
        let images = vec![encoded_image(123, 45, ImageFormat::Png)];
        let pdf = PdfAssembler.assemble(&images).unwrap();

        let doc = Document::load_mem(&pdf).unwrap();
        let (_, page_id) = doc.get_pages().into_iter().next().unwrap();
        let page = doc.get_object(page_id).unwrap().as_dict().unwrap();
        let media_box = page.get(b"MediaBox").unwrap().as_array().unwrap();
        assert_eq!(media_box[2].as_i64().unwrap(), 123);
        assert_eq!(media_box[3].as_i64().unwrap(), 45);
    }

    #[test]
    fn rejects_non_image_bytes() {
        let result = PdfAssembler.assemble(&[b"not an image".to_vec()]);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_empty_input() {
        assert!(PdfAssembler.assemble(&[]).is_err());
    }
}
