//! `.pptx` reader: slide order, sections and slide titles
//!
//! Only the parts needed to name slides are read: `ppt/presentation.xml`
//! (slide list and the `p14:sectionLst` extension), its relationships, and the
//! slide parts themselves.

use anyhow::{anyhow, bail, Context, Result};
use quick_xml::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::constants::deck::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slide {
    pub id: u32,
    /// Text of the first shape that carries any
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub slide_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deck {
    /// Deck order
    pub slides: Vec<Slide>,
    pub sections: Vec<Section>,
}

/// One flattened entry: the section name alone when it equals the title
pub fn entry_name(section: &str, title: &str) -> String {
    if section == title {
        section.to_string()
    } else {
        format!("{}: {}", section, title)
    }
}

/// Resolve entity and character references; text with an unknown entity is kept as written
fn unescape(raw: &str) -> String {
    match escape::unescape(raw) {
        Ok(text) => text.into_owned(),
        Err(e) => {
            debug!(error = %e, "Keeping text with an unresolved reference");
            raw.to_string()
        }
    }
}

fn attribute(elem: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    elem.attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == key)
        .map(|attr| unescape(&String::from_utf8_lossy(&attr.value)))
}

fn read_part<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<String> {
    let mut part = archive
        .by_name(name)
        .with_context(|| format!("Deck is missing part {}", name))?;
    let mut contents = String::new();
    part.read_to_string(&mut contents)
        .with_context(|| format!("Failed to read deck part {}", name))?;
    Ok(contents)
}

/// Slide list entry from `presentation.xml`
#[derive(Debug)]
struct SlideRef {
    id: u32,
    rel_id: String,
}

fn parse_id(value: Option<String>, what: &str) -> Result<u32> {
    let value = value.ok_or_else(|| anyhow!("{} without an id", what))?;
    value.parse().with_context(|| format!("Invalid {} id '{}'", what, value))
}

/// Slide references in deck order plus the section list
fn parse_presentation(xml: &str) -> Result<(Vec<SlideRef>, Vec<Section>)> {
    let mut reader = Reader::from_str(xml);
    let mut slides = Vec::new();
    let mut sections: Vec<Section> = Vec::new();
    let mut in_section = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(elem)) | Ok(Event::Empty(elem)) => match elem.name().as_ref() {
                b"p:sldId" => slides.push(SlideRef {
                    id: parse_id(attribute(&elem, b"id"), "slide")?,
                    rel_id: attribute(&elem, b"r:id").ok_or_else(|| anyhow!("Slide entry without a relationship id"))?,
                }),
                b"p14:section" => {
                    sections.push(Section {
                        name: attribute(&elem, b"name").unwrap_or_default(),
                        slide_ids: Vec::new(),
                    });
                    in_section = true;
                }
                b"p14:sldId" if in_section => {
                    let id = parse_id(attribute(&elem, b"id"), "section slide")?;
                    if let Some(section) = sections.last_mut() {
                        section.slide_ids.push(id);
                    }
                }
                _ => {}
            },
            Ok(Event::End(elem)) if elem.name().as_ref() == b"p14:section" => in_section = false,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => bail!("XML parse error in presentation.xml at position {}: {:?}", reader.error_position(), e),
        }
    }
    Ok((slides, sections))
}

/// Relationship id → archive path of its target
fn parse_relationships(xml: &str) -> Result<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    let mut targets = HashMap::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(elem)) | Ok(Event::Empty(elem)) if elem.name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attribute(&elem, b"Id"), attribute(&elem, b"Target")) {
                    let path = match target.strip_prefix('/') {
                        Some(absolute) => absolute.to_string(),
                        None => format!("{}{}", PART_ROOT, target),
                    };
                    targets.insert(id, path);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => bail!("XML parse error in presentation relationships at position {}: {:?}", reader.error_position(), e),
        }
    }
    Ok(targets)
}

/// Text of the first shape with any: paragraphs joined with a space, trimmed
fn parse_slide_title(xml: &str) -> Result<Option<String>> {
    let mut reader = Reader::from_str(xml);
    let mut shape_depth = 0usize;
    let mut in_text_run = false;
    let mut paragraphs: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(elem)) => match elem.name().as_ref() {
                b"p:sp" => {
                    if shape_depth == 0 {
                        paragraphs.clear();
                    }
                    shape_depth += 1;
                }
                b"a:p" if shape_depth > 0 => paragraphs.push(String::new()),
                b"a:t" if shape_depth > 0 => in_text_run = true,
                _ => {}
            },
            Ok(Event::Text(text)) if in_text_run => {
                if let Some(paragraph) = paragraphs.last_mut() {
                    paragraph.push_str(&unescape(&String::from_utf8_lossy(&text)));
                }
            }
            Ok(Event::GeneralRef(entity)) if in_text_run => {
                if let Some(paragraph) = paragraphs.last_mut() {
                    paragraph.push_str(&unescape(&format!("&{};", String::from_utf8_lossy(&entity))));
                }
            }
            Ok(Event::End(elem)) => match elem.name().as_ref() {
                b"a:t" => in_text_run = false,
                b"p:sp" if shape_depth > 0 => {
                    shape_depth -= 1;
                    if shape_depth == 0 {
                        let text = paragraphs
                            .iter()
                            .map(|p| p.trim())
                            .filter(|p| !p.is_empty())
                            .collect::<Vec<_>>()
                            .join(" ");
                        if !text.is_empty() {
                            return Ok(Some(text));
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => bail!("XML parse error in slide at position {}: {:?}", reader.error_position(), e),
        }
    }
    Ok(None)
}

impl Deck {
    #[tracing::instrument]
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open deck {}", path.display()))?;
        let deck = Self::from_reader(BufReader::new(file)).with_context(|| format!("Failed to read deck {}", path.display()))?;
        info!(path = %path.display(), slides = deck.slides.len(), sections = deck.sections.len(), "Opened deck");
        Ok(deck)
    }

    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self> {
        let mut archive = ZipArchive::new(reader).context("Deck is not a zip container")?;
        let (refs, sections) = parse_presentation(&read_part(&mut archive, PRESENTATION_PART)?)?;
        let targets = parse_relationships(&read_part(&mut archive, PRESENTATION_RELS_PART)?)?;

        let mut slides = Vec::with_capacity(refs.len());
        for slide_ref in refs {
            let part = targets
                .get(&slide_ref.rel_id)
                .ok_or_else(|| anyhow!("Slide {} refers to unknown relationship {}", slide_ref.id, slide_ref.rel_id))?;
            let title = parse_slide_title(&read_part(&mut archive, part)?)
                .with_context(|| format!("Failed to read title of slide {}", slide_ref.id))?;
            debug!(id = slide_ref.id, part = %part, title = ?title, "Read slide");
            slides.push(Slide { id: slide_ref.id, title });
        }
        Ok(Self { slides, sections })
    }

    /// Title of the slide at `index` (0-based), or its placeholder
    fn title_at(&self, index: usize) -> String {
        self.slides[index]
            .title
            .clone()
            .unwrap_or_else(|| format!("{} {}", UNTITLED_PREFIX, index + 1))
    }

    /// Flatten sections and slides into the navigable text list
    pub fn texts(&self) -> Vec<String> {
        if self.sections.is_empty() {
            return (0..self.slides.len()).map(|i| self.title_at(i)).collect();
        }

        let positions: HashMap<u32, usize> = self.slides.iter().enumerate().map(|(i, s)| (s.id, i)).collect();
        let mut texts = Vec::with_capacity(self.slides.len());
        for section in &self.sections {
            for id in &section.slide_ids {
                match positions.get(id) {
                    Some(&index) => texts.push(entry_name(&section.name, &self.title_at(index))),
                    None => warn!(section = %section.name, slide_id = id, "Section lists a slide missing from the deck"),
                }
            }
        }
        texts
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Each shape is one string; paragraphs are separated by newlines
    fn slide_xml(shapes: &[&str]) -> String {
        let mut body = String::new();
        for shape in shapes {
            body.push_str("<p:sp><p:nvSpPr/><p:txBody>");
            for p in shape.split('\n') {
                body.push_str(&format!("<a:p><a:r><a:t>{}</a:t></a:r></a:p>", p));
            }
            body.push_str("</p:txBody></p:sp>");
        }
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><p:sld xmlns:a="a" xmlns:p="p"><p:cSld><p:spTree>{}</p:spTree></p:cSld></p:sld>"#,
            body
        )
    }

    /// In-memory `.pptx` with one slide per entry and optional sections (name, 1-based slide numbers)
    pub(crate) fn build_deck(slides: &[&[&str]], sections: &[(&str, &[usize])]) -> Vec<u8> {
        let mut ids = String::new();
        let mut rels = String::new();
        for n in 1..=slides.len() {
            ids.push_str(&format!(r#"<p:sldId id="{}" r:id="rId{}"/>"#, 255 + n, n + 1));
            rels.push_str(&format!(
                r#"<Relationship Id="rId{}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/slide" Target="slides/slide{}.xml"/>"#,
                n + 1,
                n
            ));
        }

        let mut section_xml = String::new();
        if !sections.is_empty() {
            section_xml.push_str(r#"<p:extLst><p:ext uri="{521415D9-36F7-43E2-AB2F-B90AF26B5E84}"><p14:sectionLst>"#);
            for (name, members) in sections {
                section_xml.push_str(&format!(r#"<p14:section name="{}" id="{{0}}"><p14:sldIdLst>"#, name));
                for n in members.iter() {
                    section_xml.push_str(&format!(r#"<p14:sldId id="{}"/>"#, 255 + n));
                }
                section_xml.push_str("</p14:sldIdLst></p14:section>");
            }
            section_xml.push_str("</p14:sectionLst></p:ext></p:extLst>");
        }

        let presentation = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><p:presentation xmlns:p="p" xmlns:r="r" xmlns:p14="p14"><p:sldIdLst>{}</p:sldIdLst>{}</p:presentation>"#,
            ids, section_xml
        );
        let relationships = format!(r#"<?xml version="1.0" encoding="UTF-8"?><Relationships>{}</Relationships>"#, rels);

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        zip.start_file(PRESENTATION_PART, options).unwrap();
        zip.write_all(presentation.as_bytes()).unwrap();
        zip.start_file(PRESENTATION_RELS_PART, options).unwrap();
        zip.write_all(relationships.as_bytes()).unwrap();
        for (i, shapes) in slides.iter().enumerate() {
            zip.start_file(format!("ppt/slides/slide{}.xml", i + 1), options).unwrap();
            zip.write_all(slide_xml(shapes).as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn open(bytes: Vec<u8>) -> Deck {
        Deck::from_reader(Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn test_sections_flatten_with_names() {
        let bytes = build_deck(
            &[&["Intro"], &["Welcome"], &["Results"], &["Summary"]],
            &[("Intro", &[1, 2]), ("Data", &[3]), ("Data", &[4])],
        );
        assert_eq!(
            open(bytes).texts(),
            vec!["Intro", "Intro: Welcome", "Data: Results", "Data: Summary"]
        );
    }

    #[test]
    fn test_deck_without_sections_uses_bare_titles() {
        let deck = open(build_deck(&[&["One"], &["Two"]], &[]));
        assert!(deck.sections.is_empty());
        assert_eq!(deck.texts(), vec!["One", "Two"]);
    }

    #[test]
    fn test_untitled_slide_uses_deck_position() {
        let deck = open(build_deck(&[&["Title"], &[], &["\n  "]], &[("Main", &[1, 2, 3])]));
        assert_eq!(deck.slides[1].title, None);
        assert_eq!(
            deck.texts(),
            vec!["Main: Title", "Main: Untitled Slide 2", "Main: Untitled Slide 3"]
        );
    }

    #[test]
    fn test_first_shape_with_text_wins() {
        let deck = open(build_deck(&[&[" ", "Line one\nLine two", "Body"]], &[]));
        assert_eq!(deck.slides[0].title.as_deref(), Some("Line one Line two"));
    }

    #[test]
    fn test_entities_in_titles_and_section_names() {
        let deck = open(build_deck(&[&["Q&amp;A"]], &[("R&amp;D", &[1])]));
        assert_eq!(deck.texts(), vec!["R&D: Q&A"]);
    }

    #[test]
    fn test_not_a_zip_is_an_error() {
        assert!(Deck::from_reader(Cursor::new(b"plain text".to_vec())).is_err());
    }

    #[test]
    fn test_missing_slide_part_is_an_error() {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        zip.start_file(PRESENTATION_PART, options).unwrap();
        zip.write_all(br#"<p:presentation xmlns:p="p" xmlns:r="r"><p:sldIdLst><p:sldId id="256" r:id="rId2"/></p:sldIdLst></p:presentation>"#)
            .unwrap();
        zip.start_file(PRESENTATION_RELS_PART, options).unwrap();
        zip.write_all(br#"<Relationships><Relationship Id="rId2" Target="slides/slide1.xml"/></Relationships>"#)
            .unwrap();
        let bytes = zip.finish().unwrap().into_inner();
        assert!(Deck::from_reader(Cursor::new(bytes)).is_err());
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("a &lt;b&gt; &amp; &quot;c&quot; &apos;"), "a <b> & \"c\" '");
        assert_eq!(unescape("&#65;&#x42;"), "AB");
        assert_eq!(unescape("&bogus; & tail"), "&bogus; & tail");
        assert_eq!(unescape("plain"), "plain");
    }

    #[test]
    fn test_entry_name() {
        assert_eq!(entry_name("Intro", "Intro"), "Intro");
        assert_eq!(entry_name("Intro", "Agenda"), "Intro: Agenda");
    }
}
