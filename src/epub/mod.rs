mod image;
mod xml_ext;

use std::collections::HashSet;
use std::io::Write;

use xml::writer::XmlEvent;
use xml::EmitterConfig;

use crate::error::EpubError;
use crate::progress::{ChapterRecord, ChapterStatus, GeneratedEpubFile, ProgressRecord};
use crate::workspace::PathResolver;
use xml_ext::write_elements;

const ARCHIVED_PREFIX: &str = "[Archived] ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpubContents {
    #[default]
    All,
    ActiveOnly,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EpubOptions {
    pub chapters_per_volume: Option<u32>,
    pub epub_contents: EpubContents,
}

/// Builds one or more EPUB volumes from `record`'s chapters, per SPEC_FULL.md §4.9. Returns the
/// artifacts that were written; the caller is responsible for recording them into
/// `record.last_epub_processing` and saving the progress record.
pub fn build(
    record: &ProgressRecord,
    resolver: &PathResolver<'_>,
    options: &EpubOptions,
) -> Result<Vec<GeneratedEpubFile>, EpubError> {
    let included = select_chapters(record, options.epub_contents);
    let volumes = partition(&included, options.chapters_per_volume);

    let result = build_all_volumes(record, resolver, &volumes);

    std::fs::remove_dir_all(resolver.temp_cover_dir()).ok();

    result
}

fn build_all_volumes(
    record: &ProgressRecord,
    resolver: &PathResolver<'_>,
    volumes: &[Vec<&ChapterRecord>],
) -> Result<Vec<GeneratedEpubFile>, EpubError> {
    let multi = volumes.len() > 1;
    let mut generated = Vec::with_capacity(volumes.len());

    for (index, volume) in volumes.iter().enumerate() {
        let file = build_volume(record, resolver, volume, index + 1, multi)?;
        generated.push(file);
    }
    Ok(generated)
}

fn select_chapters(record: &ProgressRecord, contents: EpubContents) -> Vec<&ChapterRecord> {
    record
        .downloaded_chapters
        .iter()
        .filter(|c| match contents {
            EpubContents::ActiveOnly => c.status == ChapterStatus::Active,
            EpubContents::All => matches!(c.status, ChapterStatus::Active | ChapterStatus::Archived),
        })
        .collect()
}

fn partition<'a>(
    chapters: &[&'a ChapterRecord],
    chapters_per_volume: Option<u32>,
) -> Vec<Vec<&'a ChapterRecord>> {
    match chapters_per_volume {
        Some(n) if n > 0 && (n as usize) < chapters.len() => {
            chapters.chunks(n as usize).map(<[&ChapterRecord]>::to_vec).collect()
        }
        _ => vec![chapters.to_vec()],
    }
}

fn sanitize_filename(title: &str) -> String {
    title.replace(image::FORBIDDEN_CHARACTERS, "_")
}

fn chapter_display_title(chapter: &ChapterRecord) -> String {
    if chapter.status == ChapterStatus::Archived {
        format!("{ARCHIVED_PREFIX}{}", chapter.chapter_title)
    } else {
        chapter.chapter_title.clone()
    }
}

#[allow(clippy::too_many_lines)]
fn build_volume(
    record: &ProgressRecord,
    resolver: &PathResolver<'_>,
    chapters: &[&ChapterRecord],
    volume_number: usize,
    multi: bool,
) -> Result<GeneratedEpubFile, EpubError> {
    if chapters.is_empty() {
        return Err(EpubError::EmptyVolume(volume_number));
    }

    let book_id = if multi {
        format!("{}_vol_{volume_number}", record.permanent_id)
    } else {
        record.permanent_id.clone()
    };
    let volume_title = if multi {
        format!("{} Vol. {volume_number}", record.title())
    } else {
        record.title().to_string()
    };

    let filename = format!("{}.epub", sanitize_filename(&volume_title));
    let epub_path = resolver.epub_filepath(&filename);
    if let Some(parent) = epub_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = std::fs::File::create(&epub_path)?;
    let mut zip = zip::ZipWriter::new(file);
    let opts = zip::write::FileOptions::default();

    zip.start_file("mimetype", opts)?;
    zip.write_all(b"application/epub+zip")?;

    zip.add_directory("META-INF", opts)?;
    zip.start_file("META-INF/container.xml", opts)?;
    write_container_xml(&mut zip)?;

    zip.start_file("OEBPS/toc.ncx", opts)?;
    write_toc_ncx(&book_id, &volume_title, chapters, &mut zip)?;

    let mut image_urls: HashSet<String> = HashSet::new();
    if let Some(cover) = &record.cover_image_url {
        image_urls.insert(cover.clone());
    }

    let mut rendered_chapters = Vec::with_capacity(chapters.len());
    for chapter in chapters {
        let content = read_processed_chapter(resolver, chapter);
        image_urls.extend(image::inline_image_urls(&content));
        rendered_chapters.push((*chapter, content));
    }

    for (chapter, content) in &rendered_chapters {
        zip.start_file(format!("OEBPS/text/{}.xhtml", chapter.source_chapter_id), opts)?;
        write_chapter_xhtml(chapter, content, &mut zip)?;
    }

    let mut stored_images: HashSet<String> = HashSet::new();
    for url in &image_urls {
        let Some(name) = image::leaf_name(url) else { continue };
        match image::fetch_and_resize(url) {
            Ok(buffer) => {
                zip.start_file(format!("OEBPS/images/{name}"), opts)?;
                zip.write_all(&buffer)?;
                stored_images.insert(name);
            }
            Err(e) => image::log_image_failure(url, &e),
        }
    }

    let cover_name = record.cover_image_url.as_deref().and_then(image::leaf_name);
    zip.start_file("OEBPS/text/title.xhtml", opts)?;
    write_title_xhtml(record, &volume_title, cover_name.as_deref(), &mut zip)?;

    zip.start_file("OEBPS/content.opf", opts)?;
    write_content_opf(
        record,
        &book_id,
        &volume_title,
        chapters,
        &stored_images,
        cover_name.as_deref(),
        &mut zip,
    )?;

    zip.start_file("OEBPS/styles/stylesheet.css", opts)?;
    zip.write_all(STYLESHEET.as_bytes())?;

    zip.finish()?;

    Ok(GeneratedEpubFile {
        name: filename,
        absolute_path: epub_path.display().to_string(),
    })
}

fn read_processed_chapter(resolver: &PathResolver<'_>, chapter: &ChapterRecord) -> String {
    chapter
        .local_processed_filename
        .as_ref()
        .and_then(|name| std::fs::read_to_string(resolver.processed_content_file(name)).ok())
        .unwrap_or_default()
}

const STYLESHEET: &str = "body { font-family: serif; } .chapter-title { text-align: center; } .cover { width: 100%; }\n";

fn write_container_xml(file: &mut impl Write) -> Result<(), EpubError> {
    let mut xml = EmitterConfig::new().perform_indent(true).create_writer(file);
    write_elements(
        &mut xml,
        vec![
            XmlEvent::start_element("container")
                .attr("version", "1.0")
                .ns("", "urn:oasis:names:tc:opendocument:xmlns:container")
                .into(),
            XmlEvent::start_element("rootfiles").into(),
            XmlEvent::start_element("rootfile")
                .attr("full-path", "OEBPS/content.opf")
                .attr("media-type", "application/oebps-package+xml")
                .into(),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(),
        ],
    )
}

fn write_toc_ncx(
    book_id: &str,
    volume_title: &str,
    chapters: &[&ChapterRecord],
    file: &mut impl Write,
) -> Result<(), EpubError> {
    let mut xml = EmitterConfig::new().perform_indent(true).create_writer(file);
    write_elements(
        &mut xml,
        vec![
            XmlEvent::start_element("ncx")
                .ns("", "http://www.daisy.org/z3986/2005/ncx/")
                .attr("version", "2005-1")
                .into(),
            XmlEvent::start_element("head").into(),
            XmlEvent::start_element("meta").attr("name", "dtb:uid").attr("content", book_id).into(),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("docTitle").into(),
            XmlEvent::start_element("text").into(),
            XmlEvent::characters(volume_title),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("navMap").into(),
            XmlEvent::start_element("navPoint").attr("id", "title").attr("playOrder", "0").into(),
            XmlEvent::start_element("navLabel").into(),
            XmlEvent::start_element("text").into(),
            XmlEvent::characters("Title Page"),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("content").attr("src", "text/title.xhtml").into(),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(),
        ],
    )?;

    for (index, chapter) in chapters.iter().enumerate() {
        let title = chapter_display_title(chapter);
        let play_order = (index + 1).to_string();
        write_elements(
            &mut xml,
            vec![
                XmlEvent::start_element("navPoint")
                    .attr("id", &chapter.source_chapter_id)
                    .attr("playOrder", &play_order)
                    .into(),
                XmlEvent::start_element("navLabel").into(),
                XmlEvent::start_element("text").into(),
                XmlEvent::characters(&title),
                XmlEvent::end_element().into(),
                XmlEvent::end_element().into(),
                XmlEvent::start_element("content")
                    .attr("src", &format!("text/{}.xhtml", chapter.source_chapter_id))
                    .into(),
                XmlEvent::end_element().into(),
                XmlEvent::end_element().into(),
            ],
        )?;
    }

    write_elements(&mut xml, vec![XmlEvent::end_element().into(), XmlEvent::end_element().into()])
}

fn write_chapter_xhtml(
    chapter: &ChapterRecord,
    content: &str,
    file: &mut impl Write,
) -> Result<(), EpubError> {
    let title = chapter_display_title(chapter);
    let mut config = EmitterConfig::new().perform_indent(true);
    config.perform_escaping = false;
    let mut xml = config.create_writer(file);

    write_elements(
        &mut xml,
        vec![
            XmlEvent::characters("\n<!DOCTYPE html>\n"),
            XmlEvent::start_element("html").ns("", "http://www.w3.org/1999/xhtml").into(),
            XmlEvent::start_element("head").into(),
            XmlEvent::start_element("title").into(),
            XmlEvent::characters(&title),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("link")
                .attr("rel", "stylesheet")
                .attr("type", "text/css")
                .attr("href", "../styles/stylesheet.css")
                .into(),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("body").into(),
            XmlEvent::start_element("h1").attr("class", "chapter-title").into(),
            XmlEvent::characters(&title),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("div").attr("class", "chapter-content").into(),
            XmlEvent::characters(&image::rewrite_image_paths(content)),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(),
        ],
    )
}

fn write_title_xhtml(
    record: &ProgressRecord,
    volume_title: &str,
    cover_name: Option<&str>,
    file: &mut impl Write,
) -> Result<(), EpubError> {
    let mut config = EmitterConfig::new().perform_indent(true);
    config.perform_escaping = false;
    let mut xml = config.create_writer(file);

    write_elements(
        &mut xml,
        vec![
            XmlEvent::characters("\n<!DOCTYPE html>\n"),
            XmlEvent::start_element("html").ns("", "http://www.w3.org/1999/xhtml").into(),
            XmlEvent::start_element("head").into(),
            XmlEvent::start_element("title").into(),
            XmlEvent::characters(volume_title),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("link")
                .attr("rel", "stylesheet")
                .attr("type", "text/css")
                .attr("href", "../styles/stylesheet.css")
                .into(),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("body").into(),
        ],
    )?;

    if let Some(cover_name) = cover_name {
        write_elements(
            &mut xml,
            vec![
                XmlEvent::start_element("img")
                    .attr("src", &format!("../images/{cover_name}"))
                    .attr("alt", "Cover")
                    .attr("class", "cover")
                    .into(),
                XmlEvent::end_element().into(),
            ],
        )?;
    }

    write_elements(
        &mut xml,
        vec![
            XmlEvent::start_element("h1").attr("class", "title").into(),
            XmlEvent::characters(volume_title),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("h2").attr("class", "author").into(),
            XmlEvent::characters(&record.original_author),
            XmlEvent::end_element().into(),
        ],
    )?;

    if let Some(synopsis) = &record.synopsis {
        write_elements(
            &mut xml,
            vec![
                XmlEvent::start_element("div").attr("class", "synopsis").into(),
                XmlEvent::characters(synopsis),
                XmlEvent::end_element().into(),
            ],
        )?;
    }

    write_elements(&mut xml, vec![XmlEvent::end_element().into(), XmlEvent::end_element().into()])
}

fn write_content_opf(
    record: &ProgressRecord,
    book_id: &str,
    volume_title: &str,
    chapters: &[&ChapterRecord],
    image_filenames: &HashSet<String>,
    cover_name: Option<&str>,
    file: &mut impl Write,
) -> Result<(), EpubError> {
    let mut xml = EmitterConfig::new().perform_indent(true).create_writer(file);

    write_elements(
        &mut xml,
        vec![
            XmlEvent::start_element("package")
                .ns("", "http://www.idpf.org/2007/opf")
                .attr("version", "3.0")
                .attr("unique-identifier", "bookid")
                .into(),
            XmlEvent::start_element("metadata").ns("dc", "http://purl.org/dc/elements/1.1/").into(),
            XmlEvent::start_element("dc:title").into(),
            XmlEvent::characters(volume_title),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("dc:creator").into(),
            XmlEvent::characters(&record.original_author),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("dc:source").into(),
            XmlEvent::characters(&record.story_url),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("dc:description").into(),
            XmlEvent::characters(record.synopsis.as_deref().unwrap_or_default()),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("dc:identifier").attr("id", "bookid").into(),
            XmlEvent::characters(book_id),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("dc:language").into(),
            XmlEvent::characters("en"),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("meta").attr("name", "cover").attr("content", "cover").into(),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("manifest").into(),
            XmlEvent::start_element("item")
                .attr("id", "title")
                .attr("href", "text/title.xhtml")
                .attr("media-type", "application/xhtml+xml")
                .into(),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("item")
                .attr("id", "stylesheet")
                .attr("href", "styles/stylesheet.css")
                .attr("media-type", "text/css")
                .into(),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("item")
                .attr("id", "toc")
                .attr("href", "toc.ncx")
                .attr("media-type", "application/x-dtbncx+xml")
                .into(),
            XmlEvent::end_element().into(),
        ],
    )?;

    for filename in image_filenames {
        let id = if Some(filename.as_str()) == cover_name {
            "cover".to_string()
        } else {
            filename.clone()
        };
        write_elements(
            &mut xml,
            vec![
                XmlEvent::start_element("item")
                    .attr("id", &id)
                    .attr("href", &format!("images/{filename}"))
                    .attr("media-type", image::media_type(filename))
                    .into(),
                XmlEvent::end_element().into(),
            ],
        )?;
    }

    for chapter in chapters {
        write_elements(
            &mut xml,
            vec![
                XmlEvent::start_element("item")
                    .attr("id", &chapter.source_chapter_id)
                    .attr("href", &format!("text/{}.xhtml", chapter.source_chapter_id))
                    .attr("media-type", "application/xhtml+xml")
                    .into(),
                XmlEvent::end_element().into(),
            ],
        )?;
    }

    write_elements(
        &mut xml,
        vec![
            XmlEvent::end_element().into(), // manifest
            XmlEvent::start_element("spine").attr("toc", "toc").into(),
            XmlEvent::start_element("itemref").attr("idref", "title").into(),
            XmlEvent::end_element().into(),
        ],
    )?;

    for chapter in chapters {
        write_elements(
            &mut xml,
            vec![
                XmlEvent::start_element("itemref").attr("idref", &chapter.source_chapter_id).into(),
                XmlEvent::end_element().into(),
            ],
        )?;
    }

    write_elements(
        &mut xml,
        vec![
            XmlEvent::end_element().into(), // spine
            XmlEvent::end_element().into(), // package
        ],
    )
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::index::StoryIndex;

    fn active_chapter(order: u32, id: &str, resolver: &PathResolver<'_>, now: chrono::DateTime<Utc>) -> ChapterRecord {
        let raw_name = format!("{id}.html");
        let processed_name = format!("{id}_clean.html");
        std::fs::create_dir_all(resolver.processed_content_dir()).expect("mkdir");
        std::fs::write(
            resolver.processed_content_file(&processed_name),
            format!("<p>Chapter {id} body</p>"),
        )
        .expect("write chapter");

        let mut chapter = ChapterRecord::new_pending(id.to_string(), format!("https://x/{id}"), format!("Chapter {id}"), order, now);
        chapter.status = ChapterStatus::Active;
        chapter.local_raw_filename = Some(raw_name);
        chapter.local_processed_filename = Some(processed_name);
        chapter
    }

    #[test]
    fn builds_single_volume_when_under_the_chunk_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = StoryIndex::load(dir.path()).expect("index");
        let resolver = PathResolver::set_story(dir.path(), &mut index, "royalroad-1", "My Story").expect("set_story");

        let now = Utc::now();
        let mut record = ProgressRecord::new("royalroad-1", "https://x");
        record.original_title = "My Story".to_string();
        record.original_author = "An Author".to_string();
        record.downloaded_chapters = vec![
            active_chapter(1, "a", &resolver, now),
            active_chapter(2, "b", &resolver, now),
        ];

        let generated = build(&record, &resolver, &EpubOptions::default()).expect("build");

        assert_eq!(generated.len(), 1);
        assert!(std::path::Path::new(&generated[0].absolute_path).exists());
    }

    #[test]
    fn partitions_into_multiple_volumes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = StoryIndex::load(dir.path()).expect("index");
        let resolver = PathResolver::set_story(dir.path(), &mut index, "royalroad-1", "My Story").expect("set_story");

        let now = Utc::now();
        let mut record = ProgressRecord::new("royalroad-1", "https://x");
        record.original_title = "My Story".to_string();
        record.downloaded_chapters = (1..=5)
            .map(|i| active_chapter(i, &i.to_string(), &resolver, now))
            .collect();

        let options = EpubOptions {
            chapters_per_volume: Some(2),
            epub_contents: EpubContents::All,
        };
        let generated = build(&record, &resolver, &options).expect("build");

        assert_eq!(generated.len(), 3);
    }

    #[test]
    fn active_only_excludes_archived_chapters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = StoryIndex::load(dir.path()).expect("index");
        let resolver = PathResolver::set_story(dir.path(), &mut index, "royalroad-1", "My Story").expect("set_story");

        let now = Utc::now();
        let mut record = ProgressRecord::new("royalroad-1", "https://x");
        record.original_title = "My Story".to_string();
        let mut archived = active_chapter(1, "a", &resolver, now);
        archived.status = ChapterStatus::Archived;
        record.downloaded_chapters = vec![archived, active_chapter(2, "b", &resolver, now)];

        let included = select_chapters(&record, EpubContents::ActiveOnly);
        assert_eq!(included.len(), 1);
        assert_eq!(included[0].source_chapter_id, "b");

        let included_all = select_chapters(&record, EpubContents::All);
        assert_eq!(included_all.len(), 2);
    }
}
