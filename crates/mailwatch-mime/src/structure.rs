//! Part-tree attachment detection.

/// One node of a message's part tree, as reported by the server's
/// structure metadata (before any body bytes are fetched).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartNode {
    /// Lowercased `type/subtype`.
    pub content_type: String,
    /// Lowercased disposition, when declared.
    pub disposition: Option<String>,
    /// Declared filename, when any.
    pub filename: Option<String>,
    /// Declared size in bytes, when any.
    pub size_bytes: Option<u32>,
    /// Child parts for multipart containers.
    pub children: Vec<PartNode>,
}

/// Content-type prefixes that mark a part as an attachment when it is
/// neither body text nor a multipart wrapper.
const ATTACHMENT_TYPE_PREFIXES: [&str; 4] = ["application/", "image/", "audio/", "video/"];

/// Returns true when the tree contains at least one attachment.
///
/// A part counts as an attachment when its disposition is `attachment`,
/// when it carries a filename, or when its content type is one of the
/// binary families (application, image, audio, video).
#[must_use]
pub fn has_attachments(node: &PartNode) -> bool {
    if node.disposition.as_deref() == Some("attachment") {
        return true;
    }
    if node.filename.is_some() {
        return true;
    }
    if ATTACHMENT_TYPE_PREFIXES
        .iter()
        .any(|prefix| node.content_type.starts_with(prefix))
    {
        return true;
    }
    node.children.iter().any(has_attachments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(content_type: &str) -> PartNode {
        PartNode {
            content_type: content_type.to_string(),
            ..PartNode::default()
        }
    }

    #[test]
    fn plain_text_has_none() {
        assert!(!has_attachments(&text("text/plain")));
    }

    #[test]
    fn alternative_tree_has_none() {
        let node = PartNode {
            content_type: "multipart/alternative".to_string(),
            children: vec![text("text/plain"), text("text/html")],
            ..PartNode::default()
        };
        assert!(!has_attachments(&node));
    }

    #[test]
    fn explicit_disposition_wins() {
        let node = PartNode {
            content_type: "text/plain".to_string(),
            disposition: Some("attachment".to_string()),
            ..PartNode::default()
        };
        assert!(has_attachments(&node));
    }

    #[test]
    fn named_part_counts() {
        let node = PartNode {
            content_type: "text/calendar".to_string(),
            filename: Some("invite.ics".to_string()),
            ..PartNode::default()
        };
        assert!(has_attachments(&node));
    }

    #[test]
    fn binary_type_counts() {
        assert!(has_attachments(&text("application/pdf")));
        assert!(has_attachments(&text("image/png")));
        assert!(!has_attachments(&text("text/html")));
    }

    #[test]
    fn nested_attachment_is_found() {
        let node = PartNode {
            content_type: "multipart/mixed".to_string(),
            children: vec![
                PartNode {
                    content_type: "multipart/alternative".to_string(),
                    children: vec![text("text/plain"), text("text/html")],
                    ..PartNode::default()
                },
                text("application/zip"),
            ],
            ..PartNode::default()
        };
        assert!(has_attachments(&node));
    }
}
