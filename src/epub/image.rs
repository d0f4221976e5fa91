use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use scraper::{Html, Selector};
use tracing::warn;
use url::Url;

use crate::error::EpubError;
use crate::fetch;

pub const FORBIDDEN_CHARACTERS: [char; 13] =
    ['/', '\\', ':', '*', '?', '"', '<', '>', '|', '%', '"', '[', ']'];

const MAX_WIDTH: u32 = 600;

/// Leaf filename an image URL would be stored under inside the EPUB, with filesystem-unsafe
/// characters replaced. Mirrors the teacher's `extract_file_name`.
pub fn leaf_name(url: &str) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    parsed.set_query(None);
    parsed.set_fragment(None);
    let name = parsed.path_segments()?.next_back()?.to_string();
    if name.is_empty() {
        return None;
    }
    Some(name.replace(FORBIDDEN_CHARACTERS, "_"))
}

/// Finds every `<img src>` URL referenced by a chapter/synopsis fragment.
pub fn inline_image_urls(fragment: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse("img") else {
        return Vec::new();
    };
    Html::parse_fragment(fragment)
        .select(&selector)
        .filter_map(|e| e.value().attr("src"))
        .map(ToString::to_string)
        .collect()
}

/// Rewrites every `<img src="...">` in `fragment` to point at the EPUB-local `../images/<name>`
/// path the image was (or would have been) written under.
pub fn rewrite_image_paths(fragment: &str) -> String {
    let mut out = fragment.to_string();
    for url in inline_image_urls(fragment) {
        if let Some(name) = leaf_name(&url) {
            out = out.replace(&url, &format!("../images/{name}"));
        }
    }
    out
}

/// Downloads an image and resizes it to a max width of 600px, re-encoding WebP/PNG to PNG and
/// JPEG to JPEG, so every e-reader can display it regardless of source format.
pub fn fetch_and_resize(url: &str) -> Result<Vec<u8>, EpubError> {
    let raw = fetch::get_bytes(url).map_err(|e| EpubError::Io(std::io::Error::other(e)))?;
    resize(&raw)
}

fn to_epub_err(e: image::ImageError) -> EpubError {
    EpubError::Io(std::io::Error::other(e))
}

fn resize(bytes: &[u8]) -> Result<Vec<u8>, EpubError> {
    let format = image::guess_format(bytes).map_err(to_epub_err)?;

    if !matches!(
        format,
        image::ImageFormat::Png | image::ImageFormat::Jpeg | image::ImageFormat::WebP
    ) {
        // Formats we don't resize (GIF, unknown) pass through untouched.
        return Ok(bytes.to_vec());
    }

    let decoded = image::load_from_memory_with_format(bytes, format).map_err(to_epub_err)?;
    let (width, height) = (decoded.width(), decoded.height());
    let resized = if width > MAX_WIDTH && width > 0 {
        decoded.resize(MAX_WIDTH, MAX_WIDTH * height / width, image::imageops::FilterType::Lanczos3)
    } else {
        decoded
    };

    let mut buffer = Vec::new();
    match format {
        image::ImageFormat::Jpeg => {
            resized
                .write_with_encoder(JpegEncoder::new_with_quality(Cursor::new(&mut buffer), 80))
                .map_err(to_epub_err)?;
        }
        // WebP is decoded and re-encoded to PNG: not every e-reader supports WebP.
        image::ImageFormat::Png | image::ImageFormat::WebP => {
            resized
                .write_with_encoder(PngEncoder::new_with_quality(
                    Cursor::new(&mut buffer),
                    CompressionType::Fast,
                    FilterType::Adaptive,
                ))
                .map_err(to_epub_err)?;
        }
        _ => unreachable!("filtered above"),
    }
    Ok(buffer)
}

/// Media type used in the OPF manifest for a stored image filename.
pub fn media_type(filename: &str) -> &'static str {
    match filename.rsplit('.').next().unwrap_or("").to_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        _ => "image/png",
    }
}

pub fn log_image_failure(url: &str, error: &EpubError) {
    warn!(url, %error, "could not fetch/resize inline image, skipping");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_name_strips_query_and_sanitizes() {
        let name = leaf_name("https://example.com/covers/my:cover.jpg?x=1").expect("name");
        assert_eq!(name, "my_cover.jpg");
    }

    #[test]
    fn inline_image_urls_finds_img_tags() {
        let html = r#"<p>Text</p><img src="https://x/a.png"><img src="b.jpg">"#;
        let urls = inline_image_urls(html);
        assert_eq!(urls, vec!["https://x/a.png".to_string(), "b.jpg".to_string()]);
    }

    #[test]
    fn rewrite_image_paths_points_at_local_images_dir() {
        let html = r#"<img src="https://x/cover.png">"#;
        let rewritten = rewrite_image_paths(html);
        assert_eq!(rewritten, r#"<img src="../images/cover.png">"#);
    }

    #[test]
    fn media_type_defaults_to_png() {
        assert_eq!(media_type("a.jpg"), "image/jpeg");
        assert_eq!(media_type("a.gif"), "image/gif");
        assert_eq!(media_type("a.png"), "image/png");
        assert_eq!(media_type("a"), "image/png");
    }
}
