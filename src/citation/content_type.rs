//! Content-type labeling for citations, per source spec §4.5.4: a citation
//! is tagged `image` whenever the source chunk shows any OCR/image signal,
//! never surfacing an image index number that could mislead a reader about
//! which image on the page produced the text (the index is internal
//! bookkeeping, not a stable, human-facing identifier).

use crate::types::{Chunk, ContentTypeLabel, ImageRef};

/// Collapse a chunk's content type and its various image signals into the
/// two-valued label a citation actually carries.
pub fn label_for_chunk(chunk: &Chunk) -> ContentTypeLabel {
    if chunk.is_image_ocr() {
        ContentTypeLabel::Image
    } else {
        ContentTypeLabel::Text
    }
}

/// The `image_ref` to attach to a citation, if any — carried through
/// verbatim as structured data for downstream consumers that want
/// bounding-box detail. Never formatted into the citation's displayed
/// location string: ingestion's image numbering is document-wide, so
/// rendering e.g. "Image 2 on page 3" would mislead a reader about which
/// image on the page the text came from. The displayed location is always
/// "Page N" only, regardless of whether `image_ref` is present.
pub fn image_ref_for_citation(chunk: &Chunk) -> Option<ImageRef> {
    if label_for_chunk(chunk) == ContentTypeLabel::Image {
        chunk.image_ref.clone()
    } else {
        None
    }
}

/// The citation's displayed location string. Always "Page N"; an
/// `image_ref`'s index is intentionally never interpolated in here.
pub fn display_location(page: u32) -> String {
    format!("Page {page}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentType;

    fn base_chunk() -> Chunk {
        Chunk {
            id: "1".to_string(),
            text: "plain body text".to_string(),
            vector: vec![],
            source: "doc.pdf".to_string(),
            document_id: "doc-1".to_string(),
            page: 1,
            start_char: 0,
            end_char: 10,
            chunk_index: 0,
            language: "eng".to_string(),
            content_type: ContentType::Text,
            page_blocks: vec![],
            image_ref: None,
            text_english: None,
            metadata: Default::default(),
        }
    }

    #[test]
    fn plain_text_chunk_labeled_text() {
        assert_eq!(label_for_chunk(&base_chunk()), ContentTypeLabel::Text);
    }

    #[test]
    fn image_ocr_content_type_labeled_image() {
        let mut chunk = base_chunk();
        chunk.content_type = ContentType::ImageOcr;
        assert_eq!(label_for_chunk(&chunk), ContentTypeLabel::Image);
    }

    #[test]
    fn ocr_marker_in_text_labeled_image_even_with_text_content_type() {
        let mut chunk = base_chunk();
        chunk.text = "<!-- image -->\nOCR output".to_string();
        assert_eq!(label_for_chunk(&chunk), ContentTypeLabel::Image);
    }

    #[test]
    fn image_ref_present_makes_the_chunk_image_labeled() {
        let mut chunk = base_chunk();
        chunk.image_ref = Some(ImageRef { page: 1, image_index: 3, bbox: None });
        assert_eq!(label_for_chunk(&chunk), ContentTypeLabel::Image);
        assert!(image_ref_for_citation(&chunk).is_some());
    }

    #[test]
    fn display_location_never_mentions_image_index() {
        let location = display_location(7);
        assert_eq!(location, "Page 7");
        assert!(!location.contains("Image"));
    }
}
